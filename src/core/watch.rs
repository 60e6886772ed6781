//! Event log reader behind `watch`
//!
//! Keeps a cursor (last event id read) and an optional assignee filter. The
//! filter looks at the *current* assignee of each event's task at read time,
//! so reassigning a task changes which of its past events match.

use super::error::Result;
use super::events::Event;
use super::store::{Store, Txn};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct EventWatcher {
    cursor: i64,
    assignee: Option<String>,
}

impl EventWatcher {
    /// Start after event `since` (0 = from the beginning)
    pub fn new(since: i64, assignee: Option<String>) -> Self {
        Self {
            cursor: since.max(0),
            assignee,
        }
    }

    /// Id of the last event read, matching or not
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Single shot: events past the cursor that pass the filter, oldest first
    pub fn poll(&mut self, store: &mut Store) -> Result<Vec<Event>> {
        let cursor = self.cursor;
        let assignee = self.assignee.clone();
        let (last_id, events) = store.read(|txn| {
            let events = txn.list_events_since(cursor)?;
            let last_id = events.last().map_or(cursor, |e| e.id);
            let mut matching = Vec::with_capacity(events.len());
            for event in events {
                if passes_filter(txn, assignee.as_deref(), &event)? {
                    matching.push(event);
                }
            }
            Ok((last_id, matching))
        })?;
        self.cursor = last_id;
        Ok(events)
    }

    /// Poll every `interval` and hand matching events to `sink` until
    /// `cancel` fires. Cancellation is checked before every poll.
    pub async fn follow<F>(
        &mut self,
        store: &mut Store,
        interval: Duration,
        cancel: CancellationToken,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(&Event),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("watch cancelled at event {}", self.cursor);
                    return Ok(());
                }
                _ = ticker.tick() => {
                    for event in self.poll(store)? {
                        sink(&event);
                    }
                }
            }
        }
    }
}

fn passes_filter(txn: &Txn<'_>, assignee: Option<&str>, event: &Event) -> Result<bool> {
    let Some(wanted) = assignee else {
        return Ok(true);
    };
    match event.filter_task() {
        // Task-less events (e.g. cycle reports) are always shown
        None => Ok(true),
        Some(task_id) => Ok(txn.assignee_of(task_id)?.as_deref() == Some(wanted)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EventKind, NewEvent};
    use crate::core::model::{NewTask, TaskId, TaskUpdate};
    use crate::core::store::StoreOptions;
    use tempfile::TempDir;

    fn seed(store: &mut Store) -> (TaskId, TaskId) {
        store
            .write(|txn| {
                let a = txn.create_task(&NewTask::new("a").with_assignee("alice"))?.id;
                let b = txn.create_task(&NewTask::new("b").with_assignee("bob"))?.id;
                txn.append_event(&NewEvent::new(EventKind::TaskCreated, "t").task(a))?;
                txn.append_event(&NewEvent::new(EventKind::TaskCreated, "t").task(b))?;
                txn.append_event(&NewEvent::new(EventKind::ImpactNotice, "t").task(b).target(a))?;
                txn.append_event(&NewEvent::new(EventKind::DoctorCycle, "t"))?;
                Ok((a, b))
            })
            .unwrap()
    }

    #[test]
    fn test_poll_advances_cursor() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let mut watcher = EventWatcher::new(0, None);
        assert_eq!(watcher.poll(&mut store).unwrap().len(), 4);
        assert_eq!(watcher.cursor(), 4);
        assert!(watcher.poll(&mut store).unwrap().is_empty());
    }

    #[test]
    fn test_since_skips_older_events() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let events = EventWatcher::new(2, None).poll(&mut store).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_assignee_filter_uses_target_then_subject() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let events = EventWatcher::new(0, Some("alice".into()))
            .poll(&mut store)
            .unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        // own creation, notice targeting alice's task, task-less cycle report
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn test_filter_is_evaluated_at_read_time() {
        let mut store = Store::open_in_memory().unwrap();
        let (_, b) = seed(&mut store);
        store
            .write(|txn| {
                txn.update_task(
                    b,
                    &TaskUpdate {
                        assignee: Some("alice".into()),
                        ..TaskUpdate::default()
                    },
                )
            })
            .unwrap();
        let events = EventWatcher::new(0, Some("alice".into()))
            .poll(&mut store)
            .unwrap();
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_follow_stops_when_cancelled_up_front() {
        let mut store = Store::open_in_memory().unwrap();
        seed(&mut store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut watcher = EventWatcher::new(0, None);
        let mut seen = 0;
        tokio_test::block_on(watcher.follow(
            &mut store,
            Duration::from_millis(10),
            cancel,
            |_| seen += 1,
        ))
        .unwrap();
        assert_eq!(seen, 0);
        assert_eq!(watcher.cursor(), 0);
    }

    #[tokio::test]
    async fn test_follow_picks_up_new_events_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        let mut store = Store::open(&path, StoreOptions::default()).unwrap();
        seed(&mut store);

        let cancel = CancellationToken::new();
        let writer_cancel = cancel.clone();
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut other = Store::open(&writer_path, StoreOptions::default()).unwrap();
            other
                .write(|txn| txn.append_event(&NewEvent::new(EventKind::NoteAdded, "agent-2").task(1)))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer_cancel.cancel();
        });

        let mut watcher = EventWatcher::new(0, None);
        let mut seen = Vec::new();
        watcher
            .follow(&mut store, Duration::from_millis(10), cancel, |e| {
                seen.push((e.id, e.kind))
            })
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(seen.len(), 5);
        assert_eq!(seen[4], (5, EventKind::NoteAdded));
        assert_eq!(watcher.cursor(), 5);
    }
}
