use chrono::{NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// How often a rule fires. Exhaustive — there is no fallback cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
    /// Weekly cadence with an optional day-of-week pin; without one,
    /// every day is a candidate.
    Custom,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Custom => "custom",
        }
    }
}

/// The periodicity part of a rule: cadence, period multiplier, and the
/// day pin the cadence keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    /// Period multiplier, >= 1 (interval=2 with Weekly means every 2 weeks).
    pub interval: u32,
    /// Day pin for Weekly/Biweekly/Custom. Wire format is 0-6, 0 = Sunday.
    pub day_of_week: Option<Weekday>,
    /// Day pin for Monthly, 1-31. Short months clamp to month end.
    pub day_of_month: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// A cleaning service offering. Price and duration are copied onto
/// bookings at generation time, never re-derived afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub base_price: Decimal,
    pub estimated_minutes: u32,
}

/// One materialized visit. Day granularity for scheduling; time-of-day
/// rides along from the rule's preferred time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub rule_id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub recurring: bool,
}

/// Full per-rule state: the recurrence config plus the skip dates and
/// bookings that hang off it. One write lock guards all of it, which is
/// what serializes generation per rule while rules stay concurrent with
/// each other.
#[derive(Debug, Clone)]
pub struct RuleState {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub address_id: Ulid,
    pub service_id: Ulid,
    pub recurrence: Recurrence,
    pub preferred_time: NaiveTime,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub is_paused: bool,
    /// Skip dates with optional reason. Keyed by date, so uniqueness per
    /// rule falls out of the map.
    pub skip_dates: std::collections::BTreeMap<NaiveDate, Option<String>>,
    /// All bookings under this rule, sorted by date. Any status counts
    /// for de-duplication.
    pub bookings: Vec<Booking>,
}

impl RuleState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Ulid,
        customer_id: Ulid,
        address_id: Ulid,
        service_id: Ulid,
        recurrence: Recurrence,
        preferred_time: NaiveTime,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        is_active: bool,
        is_paused: bool,
    ) -> Self {
        Self {
            id,
            customer_id,
            address_id,
            service_id,
            recurrence,
            preferred_time,
            start_date,
            end_date,
            is_active,
            is_paused,
            skip_dates: std::collections::BTreeMap::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by date.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.date, |b| b.date)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove a booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// The booking occupying a calendar date, if any. Dates are unique
    /// per rule, so the sorted vec admits binary search.
    pub fn booking_on(&self, date: NaiveDate) -> Option<&Booking> {
        self.bookings
            .binary_search_by_key(&date, |b| b.date)
            .ok()
            .map(|pos| &self.bookings[pos])
    }

    pub fn has_booking_on(&self, date: NaiveDate) -> bool {
        self.booking_on(date).is_some()
    }
}

/// Partial update for the mutable rule fields. `None` leaves the field
/// untouched; the nested options distinguish "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleChanges {
    pub frequency: Option<Frequency>,
    pub interval: Option<u32>,
    pub day_of_week: Option<Option<Weekday>>,
    pub day_of_month: Option<Option<u32>>,
    pub preferred_time: Option<NaiveTime>,
    pub end_date: Option<Option<NaiveDate>>,
    pub is_active: Option<bool>,
    pub is_paused: Option<bool>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        id: Ulid,
        name: String,
        base_price: Decimal,
        estimated_minutes: u32,
    },
    ServiceUpdated {
        id: Ulid,
        name: String,
        base_price: Decimal,
        estimated_minutes: u32,
    },
    ServiceDeleted {
        id: Ulid,
    },
    RuleCreated {
        id: Ulid,
        customer_id: Ulid,
        address_id: Ulid,
        service_id: Ulid,
        recurrence: Recurrence,
        preferred_time: NaiveTime,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        is_active: bool,
        is_paused: bool,
    },
    RuleUpdated {
        id: Ulid,
        recurrence: Recurrence,
        preferred_time: NaiveTime,
        end_date: Option<NaiveDate>,
        is_active: bool,
        is_paused: bool,
    },
    RuleDeleted {
        id: Ulid,
    },
    SkipDateAdded {
        rule_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    },
    SkipDateRemoved {
        rule_id: Ulid,
        date: NaiveDate,
    },
    BookingCreated {
        id: Ulid,
        rule_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
        duration_minutes: u32,
        status: BookingStatus,
        subtotal: Decimal,
        tax: Decimal,
        total: Decimal,
        recurring: bool,
    },
    /// Status flip to Cancelled. The row stays, so the date stays taken.
    BookingCancelled {
        id: Ulid,
        rule_id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        rule_id: Ulid,
    },
    /// Hard removal — the date becomes generatable again.
    BookingDeleted {
        id: Ulid,
        rule_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub address_id: Ulid,
    pub service_id: Ulid,
    pub recurrence: Recurrence,
    pub preferred_time: NaiveTime,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub is_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDateInfo {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Completed,
    /// Rule exists but `is_active` is false. Not an error.
    Inactive,
    /// Rule exists but `is_paused` is true. Not an error.
    Paused,
}

/// Result of one generation pass: the created bookings in chronological
/// order, or an explanatory status with nothing created.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub status: GenerationStatus,
    pub created: Vec<Booking>,
}

impl GenerationOutcome {
    pub fn skipped(status: GenerationStatus) -> Self {
        Self {
            status,
            created: Vec::new(),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }
}
