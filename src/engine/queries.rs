use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::recurrence::occurrence_dates;
use super::{Engine, EngineError};

impl Engine {
    pub fn list_services(&self) -> Vec<Service> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_rules(&self) -> Vec<RuleInfo> {
        let handles: Vec<_> = self.rules.iter().map(|e| e.value().clone()).collect();
        let mut rules = Vec::with_capacity(handles.len());
        for rule in handles {
            let guard = rule.read().await;
            rules.push(RuleInfo {
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
        }
        rules
    }

    pub async fn get_skip_dates(&self, rule_id: Ulid) -> Result<Vec<SkipDateInfo>, EngineError> {
        let rule = match self.get_rule(&rule_id) {
            Some(rule) => rule,
            None => return Ok(vec![]),
        };
        let guard = rule.read().await;
        Ok(guard
            .skip_dates
            .iter()
            .map(|(date, reason)| SkipDateInfo {
                date: *date,
                reason: reason.clone(),
            })
            .collect())
    }

    /// All bookings under a rule, chronological.
    pub async fn get_bookings(&self, rule_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let rule = match self.get_rule(&rule_id) {
            Some(rule) => rule,
            None => return Ok(vec![]),
        };
        let guard = rule.read().await;
        Ok(guard.bookings.clone())
    }

    /// The dates a generation run would materialize right now, without
    /// materializing them. Ignores active/paused — it answers "what
    /// would this rule produce", not "will the sweep produce it".
    pub async fn preview_schedule(
        &self,
        rule_id: Ulid,
        horizon_weeks: u32,
        today: NaiveDate,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        if horizon_weeks > MAX_HORIZON_WEEKS {
            return Err(EngineError::LimitExceeded("horizon too wide"));
        }
        let rule = match self.get_rule(&rule_id) {
            Some(rule) => rule,
            None => return Ok(vec![]),
        };
        let guard = rule.read().await;
        let skip: HashSet<NaiveDate> = guard.skip_dates.keys().copied().collect();
        let existing: HashSet<NaiveDate> = guard.bookings.iter().map(|b| b.date).collect();
        Ok(occurrence_dates(
            &guard.recurrence,
            guard.start_date,
            guard.end_date,
            today,
            horizon_weeks,
            &skip,
            &existing,
        ))
    }
}
