mod error;
mod mutations;
mod pricing;
mod queries;
mod recurrence;

pub use error::EngineError;
pub use pricing::{Quote, quote, today_utc};
pub use recurrence::{
    add_months_clamped, days_in_month, first_occurrence_on_or_after, matches_day,
    next_occurrence, occurrence_dates,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRuleState = Arc<RwLock<RuleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One workspace's engine: services, rules and their bookings, backed
/// by a WAL. All mutation goes event-first through `persist_and_apply`.
pub struct Engine {
    pub rules: DashMap<Ulid, SharedRuleState>,
    pub services: DashMap<Ulid, Service>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → rule id
    pub(super) booking_to_rule: DashMap<Ulid, Ulid>,
    /// Service → rule ids index for delete guards.
    pub(super) rules_by_service: DashMap<Ulid, Vec<Ulid>>,
}

/// Apply a rule-scoped event directly to a RuleState (no locking — the
/// caller holds the lock).
fn apply_to_rule(rs: &mut RuleState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RuleUpdated {
            recurrence,
            preferred_time,
            end_date,
            is_active,
            is_paused,
            ..
        } => {
            rs.recurrence = *recurrence;
            rs.preferred_time = *preferred_time;
            rs.end_date = *end_date;
            rs.is_active = *is_active;
            rs.is_paused = *is_paused;
        }
        Event::SkipDateAdded { date, reason, .. } => {
            rs.skip_dates.insert(*date, reason.clone());
        }
        Event::SkipDateRemoved { date, .. } => {
            rs.skip_dates.remove(date);
        }
        Event::BookingCreated {
            id,
            rule_id,
            date,
            time,
            duration_minutes,
            status,
            subtotal,
            tax,
            total,
            recurring,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                rule_id: *rule_id,
                date: *date,
                time: *time,
                duration_minutes: *duration_minutes,
                status: *status,
                subtotal: *subtotal,
                tax: *tax,
                total: *total,
                recurring: *recurring,
            });
            booking_index.insert(*id, *rule_id);
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Completed;
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        // Rule/service lifecycle is handled at the DashMap level, not here
        Event::RuleCreated { .. }
        | Event::RuleDeleted { .. }
        | Event::ServiceCreated { .. }
        | Event::ServiceUpdated { .. }
        | Event::ServiceDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rules: DashMap::new(),
            services: DashMap::new(),
            wal_tx,
            notify,
            booking_to_rule: DashMap::new(),
            rules_by_service: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy
        // workspace creation).
        for event in &events {
            match event {
                Event::ServiceCreated {
                    id,
                    name,
                    base_price,
                    estimated_minutes,
                }
                | Event::ServiceUpdated {
                    id,
                    name,
                    base_price,
                    estimated_minutes,
                } => {
                    engine.services.insert(
                        *id,
                        Service {
                            id: *id,
                            name: name.clone(),
                            base_price: *base_price,
                            estimated_minutes: *estimated_minutes,
                        },
                    );
                }
                Event::ServiceDeleted { id } => {
                    engine.services.remove(id);
                    engine.rules_by_service.remove(id);
                }
                Event::RuleCreated {
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
                } => {
                    let rs = RuleState::new(
                        *id,
                        *customer_id,
                        *address_id,
                        *service_id,
                        *recurrence,
                        *preferred_time,
                        *start_date,
                        *end_date,
                        *is_active,
                        *is_paused,
                    );
                    engine.rules.insert(*id, Arc::new(RwLock::new(rs)));
                    engine.rules_by_service.entry(*service_id).or_default().push(*id);
                }
                Event::RuleDeleted { id } => {
                    if let Some((_, rule)) = engine.rules.remove(id) {
                        let guard = rule.try_read().expect("replay: uncontended read");
                        for b in &guard.bookings {
                            engine.booking_to_rule.remove(&b.id);
                        }
                        if let Some(mut rules) = engine.rules_by_service.get_mut(&guard.service_id)
                        {
                            rules.retain(|r| r != id);
                        }
                    }
                }
                other => {
                    if let Some(rule_id) = event_rule_id(other)
                        && let Some(entry) = engine.rules.get(&rule_id) {
                            let rule = entry.clone();
                            let mut guard =
                                rule.try_write().expect("replay: uncontended write");
                            apply_to_rule(&mut guard, other, &engine.booking_to_rule);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_rule(&self, id: &Ulid) -> Option<SharedRuleState> {
        self.rules.get(id).map(|e| e.value().clone())
    }

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn get_rule_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_rule.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        rule_id: Ulid,
        rs: &mut RuleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_rule(rs, event, &self.booking_to_rule);
        self.notify.send(rule_id, event);
        Ok(())
    }

    /// Lookup booking → rule, get rule, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RuleState>), EngineError> {
        let rule_id = self
            .get_rule_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rule = self
            .get_rule(&rule_id)
            .ok_or(EngineError::NotFound(rule_id))?;
        let guard = rule.write_owned().await;
        Ok((rule_id, guard))
    }
}

/// Extract the owning rule id from a rule-scoped event.
fn event_rule_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RuleUpdated { id, .. } => Some(*id),
        Event::SkipDateAdded { rule_id, .. }
        | Event::SkipDateRemoved { rule_id, .. }
        | Event::BookingCreated { rule_id, .. }
        | Event::BookingCancelled { rule_id, .. }
        | Event::BookingCompleted { rule_id, .. }
        | Event::BookingDeleted { rule_id, .. } => Some(*rule_id),
        Event::RuleCreated { .. }
        | Event::RuleDeleted { .. }
        | Event::ServiceCreated { .. }
        | Event::ServiceUpdated { .. }
        | Event::ServiceDeleted { .. } => None,
    }
}
