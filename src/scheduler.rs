// Recurring backup schedules.
//
// Each daily/weekly schedule becomes a cron expression and one spawned
// trigger task that sleeps until the next fire and enqueues the matching
// job. Triggers return immediately after the enqueue; the queue
// serializes the actual work. Manual frequency registers nothing.

use crate::jobs::{JobKind, JobQueue};
use crate::store::{Frequency, Schedule, Store};
use chrono::Local;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Drop every registered trigger and re-register from the store.
    pub async fn reload(&mut self, store: &Store, queue: &JobQueue) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }

        let settings = store.settings().await;
        for (container_id, schedule) in &settings.container_schedules {
            if let Some(handle) =
                spawn_trigger(queue.clone(), JobKind::BackupContainer, container_id, schedule)
            {
                self.handles.push(handle);
            }
        }
        for (stack_name, schedule) in &settings.stack_schedules {
            if let Some(handle) =
                spawn_trigger(queue.clone(), JobKind::BackupStack, stack_name, schedule)
            {
                self.handles.push(handle);
            }
        }
        info!("{} schedule trigger(s) registered", self.handles.len());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// `HH:MM` plus frequency into a six-field cron expression (seconds
/// pinned to zero).
pub fn cron_expression(schedule: &Schedule) -> Option<String> {
    let (hour, minute) = parse_time(&schedule.time)?;
    match schedule.frequency {
        Frequency::Manual => None,
        Frequency::Daily => Some(format!("0 {} {} * * *", minute, hour)),
        Frequency::Weekly => {
            let dow = DOW_NAMES.get(schedule.day_of_week.unwrap_or(0) as usize)?;
            Some(format!("0 {} {} * * {}", minute, hour, dow))
        }
    }
}

fn parse_time(time: &str) -> Option<(u8, u8)> {
    let (hour, minute) = time.split_once(':')?;
    let hour: u8 = hour.parse().ok()?;
    let minute: u8 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn spawn_trigger(
    queue: JobQueue,
    kind: JobKind,
    target: &str,
    schedule: &Schedule,
) -> Option<JoinHandle<()>> {
    let expression = cron_expression(schedule)?;
    let parsed = match cron::Schedule::from_str(&expression) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("invalid schedule for {}: {}", target, e);
            return None;
        }
    };

    let target = target.to_string();
    Some(tokio::spawn(async move {
        loop {
            let Some(next) = parsed.upcoming(Local).next() else {
                break;
            };
            let wait = (next - Local::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            info!("schedule fired for {} {}", kind.as_str(), target);
            queue.enqueue(kind, target.clone(), Vec::new(), None).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(frequency: Frequency, time: &str, dow: Option<u8>) -> Schedule {
        Schedule {
            frequency,
            time: time.to_string(),
            day_of_week: dow,
        }
    }

    #[test]
    fn test_daily_expression() {
        let expr = cron_expression(&schedule(Frequency::Daily, "03:30", None)).unwrap();
        assert_eq!(expr, "0 30 3 * * *");
        assert!(cron::Schedule::from_str(&expr).is_ok());
    }

    #[test]
    fn test_weekly_expression_uses_day_name() {
        let expr = cron_expression(&schedule(Frequency::Weekly, "22:15", Some(5))).unwrap();
        assert_eq!(expr, "0 15 22 * * FRI");
        assert!(cron::Schedule::from_str(&expr).is_ok());

        // Sunday is day zero.
        let expr = cron_expression(&schedule(Frequency::Weekly, "01:00", Some(0))).unwrap();
        assert_eq!(expr, "0 0 1 * * SUN");
    }

    #[test]
    fn test_manual_registers_nothing() {
        assert!(cron_expression(&schedule(Frequency::Manual, "12:00", None)).is_none());
    }

    #[test]
    fn test_invalid_time_rejected() {
        assert!(cron_expression(&schedule(Frequency::Daily, "25:00", None)).is_none());
        assert!(cron_expression(&schedule(Frequency::Daily, "12:60", None)).is_none());
        assert!(cron_expression(&schedule(Frequency::Daily, "noon", None)).is_none());
        assert!(cron_expression(&schedule(Frequency::Weekly, "12:00", Some(7))).is_none());
    }
}
