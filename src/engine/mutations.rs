use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::pricing::quote;
use super::recurrence::occurrence_dates;
use super::{Engine, EngineError, WalCommand};

fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

fn validate_recurrence(rec: &Recurrence) -> Result<(), EngineError> {
    if rec.interval == 0 {
        return Err(EngineError::InvalidRule("interval must be at least 1"));
    }
    if rec.interval > MAX_INTERVAL {
        return Err(EngineError::LimitExceeded("interval too large"));
    }
    if let Some(dom) = rec.day_of_month
        && !(1..=31).contains(&dom) {
            return Err(EngineError::InvalidRule("day_of_month must be 1-31"));
        }
    // Absent day pins are storable: such a rule simply never matches.
    Ok(())
}

impl Engine {
    pub async fn create_service(
        &self,
        id: Ulid,
        name: String,
        base_price: Decimal,
        estimated_minutes: u32,
    ) -> Result<(), EngineError> {
        if self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated {
            id,
            name: name.clone(),
            base_price,
            estimated_minutes,
        };
        self.wal_append(&event).await?;
        self.services.insert(
            id,
            Service {
                id,
                name,
                base_price,
                estimated_minutes,
            },
        );
        self.notify.send(id, &event);
        Ok(())
    }

    /// Replace the mutable service fields. Existing bookings keep the
    /// prices they were generated with.
    pub async fn update_service(
        &self,
        id: Ulid,
        name: Option<String>,
        base_price: Option<Decimal>,
        estimated_minutes: Option<u32>,
    ) -> Result<(), EngineError> {
        let current = self.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let name = name.unwrap_or(current.name);
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        let base_price = base_price.unwrap_or(current.base_price);
        let estimated_minutes = estimated_minutes.unwrap_or(current.estimated_minutes);

        let event = Event::ServiceUpdated {
            id,
            name: name.clone(),
            base_price,
            estimated_minutes,
        };
        self.wal_append(&event).await?;
        self.services.insert(
            id,
            Service {
                id,
                name,
                base_price,
                estimated_minutes,
            },
        );
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(rules) = self.rules_by_service.get(&id)
            && !rules.is_empty() {
                return Err(EngineError::ServiceInUse(id));
            }

        let event = Event::ServiceDeleted { id };
        self.wal_append(&event).await?;
        self.services.remove(&id);
        self.rules_by_service.remove(&id);
        self.notify.send(id, &event);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_rule(
        &self,
        id: Ulid,
        customer_id: Ulid,
        address_id: Ulid,
        service_id: Ulid,
        recurrence: Recurrence,
        preferred_time: NaiveTime,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Result<(), EngineError> {
        if self.rules.len() >= MAX_RULES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rules"));
        }
        validate_recurrence(&recurrence)?;
        validate_date(start_date)?;
        if let Some(end) = end_date {
            validate_date(end)?;
            if end < start_date {
                return Err(EngineError::InvalidRule("end_date before start_date"));
            }
        }
        if self.rules.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }

        // Rules come into existence active and unpaused.
        let event = Event::RuleCreated {
            id,
            customer_id,
            address_id,
            service_id,
            recurrence,
            preferred_time,
            start_date,
            end_date,
            is_active: true,
            is_paused: false,
        };
        self.wal_append(&event).await?;
        let rs = RuleState::new(
            id,
            customer_id,
            address_id,
            service_id,
            recurrence,
            preferred_time,
            start_date,
            end_date,
            true,
            false,
        );
        self.rules.insert(id, Arc::new(RwLock::new(rs)));
        self.rules_by_service.entry(service_id).or_default().push(id);
        self.notify.send(id, &event);
        Ok(())
    }

    /// Merge partial changes into the rule under its write lock and emit
    /// one full-value update event.
    pub async fn update_rule(&self, id: Ulid, changes: RuleChanges) -> Result<(), EngineError> {
        let rule = self.get_rule(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rule.write().await;

        let mut recurrence = guard.recurrence;
        if let Some(f) = changes.frequency {
            recurrence.frequency = f;
        }
        if let Some(i) = changes.interval {
            recurrence.interval = i;
        }
        if let Some(dow) = changes.day_of_week {
            recurrence.day_of_week = dow;
        }
        if let Some(dom) = changes.day_of_month {
            recurrence.day_of_month = dom;
        }
        validate_recurrence(&recurrence)?;

        let preferred_time = changes.preferred_time.unwrap_or(guard.preferred_time);
        let end_date = changes.end_date.unwrap_or(guard.end_date);
        if let Some(end) = end_date {
            validate_date(end)?;
            if end < guard.start_date {
                return Err(EngineError::InvalidRule("end_date before start_date"));
            }
        }
        let is_active = changes.is_active.unwrap_or(guard.is_active);
        let is_paused = changes.is_paused.unwrap_or(guard.is_paused);

        let event = Event::RuleUpdated {
            id,
            recurrence,
            preferred_time,
            end_date,
            is_active,
            is_paused,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Drop a rule with its skip dates and bookings.
    pub async fn delete_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let rule = self.get_rule(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rule.write().await;

        let event = Event::RuleDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_to_rule.remove(&b.id);
        }
        if let Some(mut rules) = self.rules_by_service.get_mut(&guard.service_id) {
            rules.retain(|r| r != &id);
        }
        drop(guard);
        self.rules.remove(&id);
        self.notify.send(id, &event);
        Ok(())
    }

    /// Add a skip date. Any confirmed booking already generated on that
    /// date is deleted with it; completed bookings are left alone.
    pub async fn add_skip_date(
        &self,
        rule_id: Ulid,
        date: NaiveDate,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_date(date)?;
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("skip reason too long"));
            }
        let rule = self.get_rule(&rule_id).ok_or(EngineError::NotFound(rule_id))?;
        let mut guard = rule.write().await;
        if guard.skip_dates.len() >= MAX_SKIP_DATES_PER_RULE {
            return Err(EngineError::LimitExceeded("too many skip dates on rule"));
        }
        if guard.skip_dates.contains_key(&date) {
            return Err(EngineError::SkipDateExists(date));
        }

        let event = Event::SkipDateAdded {
            rule_id,
            date,
            reason,
        };
        self.persist_and_apply(rule_id, &mut guard, &event).await?;

        let displaced = guard
            .booking_on(date)
            .filter(|b| b.status == BookingStatus::Confirmed)
            .map(|b| b.id);
        if let Some(booking_id) = displaced {
            let event = Event::BookingDeleted {
                id: booking_id,
                rule_id,
            };
            self.persist_and_apply(rule_id, &mut guard, &event).await?;
        }
        Ok(())
    }

    pub async fn remove_skip_date(&self, rule_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        let rule = self.get_rule(&rule_id).ok_or(EngineError::NotFound(rule_id))?;
        let mut guard = rule.write().await;
        if !guard.skip_dates.contains_key(&date) {
            return Err(EngineError::SkipDateNotFound(date));
        }
        let event = Event::SkipDateRemoved { rule_id, date };
        self.persist_and_apply(rule_id, &mut guard, &event).await
    }

    /// Manually book a single visit under a rule. Skip dates do not gate
    /// manual creation; the one-booking-per-date invariant does.
    pub async fn create_booking(
        &self,
        id: Ulid,
        rule_id: Ulid,
        date: NaiveDate,
        time: Option<NaiveTime>,
    ) -> Result<Booking, EngineError> {
        validate_date(date)?;
        let rule = self.get_rule(&rule_id).ok_or(EngineError::NotFound(rule_id))?;
        let mut guard = rule.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RULE {
            return Err(EngineError::LimitExceeded("too many bookings on rule"));
        }
        if self.booking_to_rule.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.has_booking_on(date) {
            return Err(EngineError::DateAlreadyBooked(date));
        }
        let service = self
            .get_service(&guard.service_id)
            .ok_or(EngineError::NotFound(guard.service_id))?;

        let price = quote(&service);
        let booking = Booking {
            id,
            rule_id,
            date,
            time: time.unwrap_or(guard.preferred_time),
            duration_minutes: service.estimated_minutes,
            status: BookingStatus::Confirmed,
            subtotal: price.subtotal,
            tax: price.tax,
            total: price.total,
            recurring: false,
        };
        let event = Event::BookingCreated {
            id: booking.id,
            rule_id,
            date: booking.date,
            time: booking.time,
            duration_minutes: booking.duration_minutes,
            status: booking.status,
            subtotal: booking.subtotal,
            tax: booking.tax,
            total: booking.total,
            recurring: booking.recurring,
        };
        self.persist_and_apply(rule_id, &mut guard, &event).await?;
        Ok(booking)
    }

    /// Status flip to Cancelled. The row stays put, so the date remains
    /// de-duplicated against regeneration.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (rule_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingCancelled { id, rule_id };
        self.persist_and_apply(rule_id, &mut guard, &event).await?;
        Ok(rule_id)
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (rule_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingCompleted { id, rule_id };
        self.persist_and_apply(rule_id, &mut guard, &event).await?;
        Ok(rule_id)
    }

    /// Hard removal. The date becomes generatable again on the next pass.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (rule_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingDeleted { id, rule_id };
        self.persist_and_apply(rule_id, &mut guard, &event).await?;
        Ok(rule_id)
    }

    /// Materialize bookings for one rule out to `today + horizon_weeks`.
    ///
    /// The whole read-compute-append pass runs under the rule's write
    /// lock: generation is serialized per rule and cannot double-create
    /// against itself. Appends are per booking with no batch rollback —
    /// a failure mid-run leaves the earlier bookings in place, and the
    /// next (idempotent) run picks up where this one stopped.
    pub async fn generate_bookings(
        &self,
        rule_id: Ulid,
        horizon_weeks: u32,
        today: NaiveDate,
    ) -> Result<GenerationOutcome, EngineError> {
        if horizon_weeks > MAX_HORIZON_WEEKS {
            return Err(EngineError::LimitExceeded("horizon too wide"));
        }
        let started = Instant::now();
        let rule = self.get_rule(&rule_id).ok_or(EngineError::NotFound(rule_id))?;
        let mut guard = rule.write().await;

        if !guard.is_active {
            return Ok(GenerationOutcome::skipped(GenerationStatus::Inactive));
        }
        if guard.is_paused {
            return Ok(GenerationOutcome::skipped(GenerationStatus::Paused));
        }
        let service = self
            .get_service(&guard.service_id)
            .ok_or(EngineError::NotFound(guard.service_id))?;

        let skip: HashSet<NaiveDate> = guard.skip_dates.keys().copied().collect();
        let existing: HashSet<NaiveDate> = guard.bookings.iter().map(|b| b.date).collect();
        let dates = occurrence_dates(
            &guard.recurrence,
            guard.start_date,
            guard.end_date,
            today,
            horizon_weeks,
            &skip,
            &existing,
        );
        if guard.bookings.len() + dates.len() > MAX_BOOKINGS_PER_RULE {
            return Err(EngineError::LimitExceeded("too many bookings on rule"));
        }

        // One quote per run; every booking in the batch carries it.
        let price = quote(&service);
        let mut created = Vec::with_capacity(dates.len());
        for date in dates {
            let booking = Booking {
                id: Ulid::new(),
                rule_id,
                date,
                time: guard.preferred_time,
                duration_minutes: service.estimated_minutes,
                status: BookingStatus::Confirmed,
                subtotal: price.subtotal,
                tax: price.tax,
                total: price.total,
                recurring: true,
            };
            let event = Event::BookingCreated {
                id: booking.id,
                rule_id,
                date: booking.date,
                time: booking.time,
                duration_minutes: booking.duration_minutes,
                status: booking.status,
                subtotal: booking.subtotal,
                tax: booking.tax,
                total: booking.total,
                recurring: booking.recurring,
            };
            self.persist_and_apply(rule_id, &mut guard, &event).await?;
            created.push(booking);
        }

        metrics::counter!(crate::observability::BOOKINGS_GENERATED_TOTAL)
            .increment(created.len() as u64);
        metrics::histogram!(crate::observability::GENERATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(GenerationOutcome {
            status: GenerationStatus::Completed,
            created,
        })
    }

    /// Generation sweep over every rule, strictly sequential so each
    /// rule's pass holds its lock alone. One rule failing does not stop
    /// the sweep; inactive and paused rules report their status.
    pub async fn generate_all(
        &self,
        horizon_weeks: u32,
        today: NaiveDate,
    ) -> Vec<(Ulid, Result<GenerationOutcome, EngineError>)> {
        let rule_ids: Vec<Ulid> = self.rules.iter().map(|e| *e.key()).collect();
        let mut results = Vec::with_capacity(rule_ids.len());
        for rule_id in rule_ids {
            let result = self.generate_bookings(rule_id, horizon_weeks, today).await;
            results.push((rule_id, result));
        }
        results
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.services.iter() {
            let s = entry.value();
            events.push(Event::ServiceCreated {
                id: s.id,
                name: s.name.clone(),
                base_price: s.base_price,
                estimated_minutes: s.estimated_minutes,
            });
        }

        let rule_ids: Vec<Ulid> = self.rules.iter().map(|e| *e.key()).collect();
        for rule_id in rule_ids {
            let Some(rule) = self.get_rule(&rule_id) else {
                continue;
            };
            let guard = rule.read().await;

            events.push(Event::RuleCreated {
                id: guard.id,
                customer_id: guard.customer_id,
                address_id: guard.address_id,
                service_id: guard.service_id,
                recurrence: guard.recurrence,
                preferred_time: guard.preferred_time,
                start_date: guard.start_date,
                end_date: guard.end_date,
                is_active: guard.is_active,
                is_paused: guard.is_paused,
            });
            for (date, reason) in &guard.skip_dates {
                events.push(Event::SkipDateAdded {
                    rule_id: guard.id,
                    date: *date,
                    reason: reason.clone(),
                });
            }
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    rule_id: b.rule_id,
                    date: b.date,
                    time: b.time,
                    duration_minutes: b.duration_minutes,
                    status: b.status,
                    subtotal: b.subtotal,
                    tax: b.tax,
                    total: b.total,
                    recurring: b.recurring,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
