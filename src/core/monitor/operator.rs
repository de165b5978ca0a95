//! Operator commands queued onto the real-time thread.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::core::alarm::{AlarmChange, AlarmEngine, AlarmId, ThresholdSet};
use crate::core::cache::PatientContextId;
use crate::error::StateFault;

type Reply<T> = oneshot::Sender<Result<T, StateFault>>;

#[derive(Debug)]
pub enum OperatorCommand {
    Acknowledge {
        id: AlarmId,
        user: String,
        reply: Reply<AlarmChange>,
    },
    Silence {
        id: AlarmId,
        duration: Duration,
        user: String,
        reason: Option<String>,
        reply: Reply<AlarmChange>,
    },
    Unsilence {
        id: AlarmId,
        user: String,
        reply: Reply<AlarmChange>,
    },
    UpdateThresholds {
        patient: Option<PatientContextId>,
        thresholds: ThresholdSet,
        reply: Reply<Vec<AlarmChange>>,
    },
}

impl OperatorCommand {
    /// Run the command against `engine` and answer the caller. Returns the
    /// alarm changes it caused, for publication.
    pub fn apply(self, engine: &mut AlarmEngine, now: DateTime<Utc>) -> Vec<AlarmChange> {
        match self {
            OperatorCommand::Acknowledge { id, user, reply } => {
                answer(reply, engine.acknowledge(id, &user, now))
            }
            OperatorCommand::Silence {
                id,
                duration,
                user,
                reason,
                reply,
            } => answer(reply, engine.silence(id, duration, &user, reason, now)),
            OperatorCommand::Unsilence { id, user, reply } => {
                answer(reply, engine.unsilence(id, &user, now))
            }
            OperatorCommand::UpdateThresholds {
                patient,
                thresholds,
                reply,
            } => {
                let result = engine.update_thresholds(patient, thresholds, now);
                let changes = result.as_ref().map(Clone::clone).unwrap_or_default();
                let _ = reply.send(result);
                changes
            }
        }
    }
}

fn answer(reply: Reply<AlarmChange>, result: Result<AlarmChange, StateFault>) -> Vec<AlarmChange> {
    match result {
        Ok(change) => {
            // The caller may have gone away; the change still stands.
            let _ = reply.send(Ok(change.clone()));
            vec![change]
        }
        Err(fault) => {
            let _ = reply.send(Err(fault));
            Vec::new()
        }
    }
}

/// Cloneable front end for operator input. Every call is answered by the
/// real-time thread, or fails with [`StateFault::Unavailable`] once it has
/// stopped.
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    tx: mpsc::Sender<OperatorCommand>,
}

impl OperatorHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OperatorCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> OperatorCommand) -> Result<T, StateFault> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StateFault::Unavailable)?;
        answer.await.map_err(|_| StateFault::Unavailable)?
    }

    pub async fn acknowledge(&self, id: AlarmId, user: &str) -> Result<AlarmChange, StateFault> {
        let user = user.to_string();
        self.call(|reply| OperatorCommand::Acknowledge { id, user, reply }).await
    }

    pub async fn silence(
        &self,
        id: AlarmId,
        duration: Duration,
        user: &str,
        reason: Option<String>,
    ) -> Result<AlarmChange, StateFault> {
        let user = user.to_string();
        self.call(|reply| OperatorCommand::Silence {
            id,
            duration,
            user,
            reason,
            reply,
        })
        .await
    }

    pub async fn unsilence(&self, id: AlarmId, user: &str) -> Result<AlarmChange, StateFault> {
        let user = user.to_string();
        self.call(|reply| OperatorCommand::Unsilence { id, user, reply }).await
    }

    pub async fn update_thresholds(
        &self,
        patient: Option<PatientContextId>,
        thresholds: ThresholdSet,
    ) -> Result<Vec<AlarmChange>, StateFault> {
        self.call(|reply| OperatorCommand::UpdateThresholds {
            patient,
            thresholds,
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alarm::{ChangeKind, ThresholdTable};
    use crate::core::cache::VitalSample;
    use std::sync::Arc;

    fn engine_with_alarm(now: DateTime<Utc>) -> (AlarmEngine, AlarmId) {
        let mut engine = AlarmEngine::with_defaults(Arc::new(ThresholdTable::default()));
        let changes = engine.evaluate(&VitalSample {
            timestamp: now,
            patient: None,
            heart_rate: Some(140.0),
            spo2: None,
            respiration_rate: None,
            sequence: 1,
        });
        let id = changes[0].alarm.id;
        (engine, id)
    }

    #[tokio::test]
    async fn test_acknowledge_round_trip() {
        let now = Utc::now();
        let (mut engine, id) = engine_with_alarm(now);
        let (handle, mut rx) = OperatorHandle::channel(4);

        let pending = tokio::spawn(async move { handle.acknowledge(id, "nurse").await });
        let command = rx.recv().await.unwrap();
        let changes = command.apply(&mut engine, now);

        assert_eq!(changes.len(), 1);
        let change = pending.await.unwrap().unwrap();
        assert_eq!(change.kind, ChangeKind::Acknowledged);
    }

    #[tokio::test]
    async fn test_state_fault_returned_to_caller() {
        let now = Utc::now();
        let (mut engine, _) = engine_with_alarm(now);
        let (handle, mut rx) = OperatorHandle::channel(4);

        let pending = tokio::spawn(async move { handle.unsilence(AlarmId(99), "nurse").await });
        let changes = rx.recv().await.unwrap().apply(&mut engine, now);

        assert!(changes.is_empty());
        assert_eq!(pending.await.unwrap(), Err(StateFault::NotFound(AlarmId(99))));
    }

    #[tokio::test]
    async fn test_stopped_engine_is_unavailable() {
        let (handle, rx) = OperatorHandle::channel(1);
        drop(rx);
        assert_eq!(
            handle.acknowledge(AlarmId(1), "nurse").await,
            Err(StateFault::Unavailable)
        );
    }
}
