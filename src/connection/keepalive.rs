//! Keepalive and timeout monitor, one task per non-stateless connection.
//!
//! The decision part (`evaluate`) is a pure function of a state snapshot so
//! it can be tested without a clock; `run` is the self-rescheduling loop.

use std::sync::Weak;
use std::time::Duration;
use tokio::time::Instant;

use super::cursor::TrxToken;
use super::wire::Scope;
use super::{Connection, ConnectionEvent, ConnectionSettings};

/// Snapshot of the connection state the monitor looks at.
#[derive(Clone, Debug)]
pub struct KeepaliveView {
    pub scope: Scope,
    pub connected: bool,
    pub locks: usize,
    pub in_transaction: bool,
    pub trx: TrxToken,
    /// Last lock or mutation.
    pub modified: Option<Instant>,
    /// Last user-driven request.
    pub touched: Instant,
    /// Last request of any kind, pings included.
    pub last_request: Instant,
    pub warned: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeepaliveAction {
    Nothing,
    Warn(String),
    Rollback(String),
    Release,
}

pub fn evaluate(view: &KeepaliveView, now: Instant, settings: &ConnectionSettings) -> KeepaliveAction {
    if view.scope == Scope::Stateless || !view.connected {
        return KeepaliveAction::Nothing;
    }

    if view.locks > 0 && view.locks >= settings.max_locks {
        let reason = format!("{} locks held (limit {})", view.locks, settings.max_locks);
        return if view.warned {
            KeepaliveAction::Rollback(reason)
        } else {
            KeepaliveAction::Warn(reason)
        };
    }

    if view.locks > 0 || view.in_transaction {
        if let Some(modified) = view.modified {
            let idle = now.saturating_duration_since(modified);
            let limit = settings.transaction_timeout;
            if idle > limit && view.warned {
                return KeepaliveAction::Rollback(format!(
                    "transaction idle for {}s",
                    idle.as_secs()
                ));
            }
            if idle > limit * 2 / 3 && !view.warned {
                let left = limit.saturating_sub(idle);
                return KeepaliveAction::Warn(format!(
                    "transaction will be rolled back in {}s",
                    left.as_secs()
                ));
            }
        }
        return KeepaliveAction::Nothing;
    }

    if view.scope == Scope::Transactional
        && now.saturating_duration_since(view.touched) > settings.connection_timeout
    {
        return KeepaliveAction::Release;
    }
    KeepaliveAction::Nothing
}

/// Time left before the next ping is due.
pub fn next_wait(view: &KeepaliveView, now: Instant, keepalive: Duration) -> Duration {
    keepalive.saturating_sub(now.saturating_duration_since(view.last_request))
}

pub async fn run(conn: Weak<Connection>) {
    let mut failures = 0u32;
    let mut wait = match conn.upgrade() {
        Some(c) => c.settings().keepalive,
        None => return,
    };

    loop {
        tokio::time::sleep(wait).await;
        let Some(c) = conn.upgrade() else { return };
        if !c.is_connected() {
            return;
        }
        let settings = c.settings().clone();

        let view = c.keepalive_view();
        let remaining = next_wait(&view, Instant::now(), settings.keepalive);
        if !remaining.is_zero() {
            wait = remaining;
            continue;
        }
        wait = settings.keepalive;

        let pinged = c.ping().await;
        if c.trx() != view.trx {
            log::debug!("keepalive {}: transaction changed during ping", c.name());
            continue;
        }
        match pinged {
            Ok(true) => failures = 0,
            other => {
                failures += 1;
                let reason = match other {
                    Err(e) => e.to_string(),
                    _ => "ping refused".to_string(),
                };
                log::warn!(
                    "keepalive {}: ping failed ({failures}/{}): {reason}",
                    c.name(),
                    settings.keepalive_failures
                );
                if failures > settings.keepalive_failures {
                    c.mark_disconnected(&reason);
                    return;
                }
                continue;
            }
        }

        match evaluate(&c.keepalive_view(), Instant::now(), &settings) {
            KeepaliveAction::Nothing => {}
            KeepaliveAction::Warn(reason) => {
                log::warn!("keepalive {}: {reason}", c.name());
                c.mark_warned();
                c.emit(ConnectionEvent::TransactionWarning {
                    connection: c.name().to_string(),
                    reason,
                });
            }
            KeepaliveAction::Rollback(reason) => {
                log::warn!("keepalive {}: forcing rollback: {reason}", c.name());
                let delivered = c.emit(ConnectionEvent::ForceRollback {
                    connection: c.name().to_string(),
                    trx: view.trx,
                    reason,
                });
                if !delivered {
                    if let Err(e) = c.rollback().await {
                        log::error!("keepalive {}: rollback failed: {e}", c.name());
                    }
                }
            }
            KeepaliveAction::Release => {
                log::info!("keepalive {}: idle, releasing session", c.name());
                if let Err(e) = c.release().await {
                    log::error!("keepalive {}: release failed: {e}", c.name());
                }
                return;
            }
        }
    }
}
