//! 按来源 IP 统计连接尝试的限流器。
//!
//! 记录表只由一个后台任务持有，调用方通过 [`ConnectionTracker`] 句柄发送
//! 命令并等待 oneshot 回复，因此无需对记录表加锁，命令按到达顺序逐条执行。

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{
    TRACKER_COOLDOWN_SECS, TRACKER_MAILBOX_CAPACITY, TRACKER_RETENTION_SECS,
    TRACKER_SWEEP_INTERVAL_SECS, TRACKER_THROTTLE_SECS,
};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Attempts allowed inside the cooldown window.
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub throttle: Duration,
    pub sweep_interval: Duration,
    pub retention: Duration,
}

impl TrackerConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            cooldown: Duration::from_secs(TRACKER_COOLDOWN_SECS),
            throttle: Duration::from_secs(TRACKER_THROTTLE_SECS),
            sweep_interval: Duration::from_secs(TRACKER_SWEEP_INTERVAL_SECS),
            retention: Duration::from_secs(TRACKER_RETENTION_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    /// The request carried no parsable source address; nothing was counted.
    UnidentifiedSource,
    /// The worker task is gone.
    Unavailable,
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::UnidentifiedSource => f.write_str("connection from non identified source"),
            TrackerError::Unavailable => f.write_str("connection tracker unavailable"),
        }
    }
}

impl std::error::Error for TrackerError {}

#[derive(Debug, Clone, Copy)]
pub struct ClientTrackRecord {
    pub attempts: u32,
    pub last_seen: Instant,
}

enum TrackerCommand {
    /// Counts one attempt and, when allowed and `authenticated`, clears it
    /// again before the next command runs.
    Validate {
        identity: IpAddr,
        authenticated: bool,
        reply: oneshot::Sender<Verdict>,
    },
}

/// Attempt history keyed by client address. Owned by the worker task only.
#[derive(Debug)]
pub struct TrackerState {
    config: TrackerConfig,
    records: HashMap<IpAddr, ClientTrackRecord>,
    last_sweep: Instant,
}

impl TrackerState {
    pub fn new(config: TrackerConfig, now: Instant) -> Self {
        Self {
            config,
            records: HashMap::new(),
            last_sweep: now,
        }
    }

    pub fn validate(&mut self, identity: IpAddr, now: Instant) -> Verdict {
        if now.saturating_duration_since(self.last_sweep) >= self.config.sweep_interval {
            self.sweep(now);
        }

        let record = self.records.entry(identity).or_insert(ClientTrackRecord {
            attempts: 0,
            last_seen: now,
        });
        // New or cleared records start counting again without a cooldown check.
        if record.attempts == 0 {
            record.attempts = 1;
            record.last_seen = now;
            return Verdict::Allow;
        }

        record.attempts = record.attempts.saturating_add(1);
        let within_cooldown = now.saturating_duration_since(record.last_seen) < self.config.cooldown;
        record.last_seen = now;

        if record.attempts > self.config.max_attempts && within_cooldown {
            return Verdict::Deny {
                attempts: record.attempts,
            };
        }
        Verdict::Allow
    }

    /// Resets the counter but keeps the record so the sweep can age it out.
    pub fn clear(&mut self, identity: IpAddr) {
        if let Some(record) = self.records.get_mut(&identity) {
            record.attempts = 0;
        }
    }

    /// 一次完整的认证尝试：计数，放行且令牌有效时立即清零。
    pub fn attempt(&mut self, identity: IpAddr, authenticated: bool, now: Instant) -> Verdict {
        let verdict = self.validate(identity, now);
        if authenticated && verdict == Verdict::Allow {
            self.clear(identity);
        }
        verdict
    }

    /// Drops records not seen within the retention window, returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let retention = self.config.retention;
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.last_seen) <= retention);
        self.last_sweep = now;
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "swept stale connection records");
        }
        removed
    }

    #[cfg(test)]
    pub fn record(&self, identity: &IpAddr) -> Option<&ClientTrackRecord> {
        self.records.get(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Cloneable handle to the tracker worker.
#[derive(Clone, Debug)]
pub struct ConnectionTracker {
    commands: mpsc::Sender<TrackerCommand>,
    throttle: Duration,
}

impl fmt::Debug for TrackerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerCommand::Validate {
                identity,
                authenticated,
                ..
            } => write!(f, "Validate({identity}, authenticated={authenticated})"),
        }
    }
}

impl ConnectionTracker {
    /// 启动后台任务并返回句柄；所有句柄释放后任务退出。
    pub fn spawn(config: TrackerConfig) -> Self {
        let (commands, mailbox) = mpsc::channel(TRACKER_MAILBOX_CAPACITY);
        let throttle = config.throttle;
        let state = TrackerState::new(config, Instant::now());
        tokio::spawn(run_worker(state, mailbox));
        Self { commands, throttle }
    }

    /// 记录一次尝试，`authenticated` 为令牌校验结果；拒绝时在返回前先等待 `throttle`。
    pub async fn validate(
        &self,
        identity: Option<IpAddr>,
        authenticated: bool,
    ) -> Result<Verdict, TrackerError> {
        let identity = identity.ok_or(TrackerError::UnidentifiedSource)?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(TrackerCommand::Validate {
                identity,
                authenticated,
                reply,
            })
            .await
            .map_err(|_| TrackerError::Unavailable)?;
        let verdict = response.await.map_err(|_| TrackerError::Unavailable)?;

        if let Verdict::Deny { attempts } = verdict {
            warn!(client_ip = %identity, attempts, "too many connection attempts using an invalid token");
            tokio::time::sleep(self.throttle).await;
        }
        Ok(verdict)
    }
}

async fn run_worker(mut state: TrackerState, mut mailbox: mpsc::Receiver<TrackerCommand>) {
    while let Some(command) = mailbox.recv().await {
        match command {
            TrackerCommand::Validate {
                identity,
                authenticated,
                reply,
            } => {
                let verdict = state.attempt(identity, authenticated, Instant::now());
                // A dropped receiver means the request was cancelled; the reply is discarded.
                let _ = reply.send(verdict);
            }
        }
    }
    debug!(records = state.len(), "connection tracker stopped");
}

#[cfg(test)]
mod tests {
    use super::{ConnectionTracker, TrackerConfig, TrackerError, TrackerState, Verdict};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::Instant;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

    fn config(max_attempts: u32) -> TrackerConfig {
        TrackerConfig {
            throttle: Duration::ZERO,
            ..TrackerConfig::new(max_attempts)
        }
    }

    fn minutes(value: u64) -> Duration {
        Duration::from_secs(value * 60)
    }

    #[test]
    fn denies_after_max_attempts_until_cooldown_elapses() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(2), start);

        assert_eq!(state.validate(CLIENT, start), Verdict::Allow);
        assert_eq!(state.validate(CLIENT, start), Verdict::Allow);
        assert_eq!(
            state.validate(CLIENT, start + Duration::from_secs(1)),
            Verdict::Deny { attempts: 3 }
        );
        assert_eq!(
            state.validate(CLIENT, start + Duration::from_secs(2)),
            Verdict::Deny { attempts: 4 }
        );

        let after_cooldown = start + Duration::from_secs(2) + Duration::from_secs(290);
        assert_eq!(state.validate(CLIENT, after_cooldown), Verdict::Allow);
    }

    #[test]
    fn zero_max_attempts_denies_second_attempt_within_cooldown() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(0), start);

        assert_eq!(state.validate(CLIENT, start), Verdict::Allow);
        assert_eq!(
            state.validate(CLIENT, start + Duration::from_secs(1)),
            Verdict::Deny { attempts: 2 }
        );
        assert_eq!(
            state.validate(CLIENT, start + Duration::from_secs(1) + Duration::from_secs(290)),
            Verdict::Allow
        );
    }

    #[test]
    fn authenticated_attempt_clears_in_the_same_step() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(0), start);

        for _ in 0..10 {
            assert_eq!(state.attempt(CLIENT, true, start), Verdict::Allow);
            assert_eq!(state.record(&CLIENT).map(|r| r.attempts), Some(0));
        }

        assert_eq!(state.attempt(CLIENT, false, start), Verdict::Allow);
        assert_eq!(
            state.attempt(CLIENT, true, start),
            Verdict::Deny { attempts: 2 }
        );
        // A denied attempt is not cleared even with a valid token.
        assert_eq!(state.record(&CLIENT).map(|r| r.attempts), Some(2));
    }

    #[test]
    fn clear_resets_counter_but_keeps_record() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(2), start);
        for _ in 0..3 {
            state.validate(CLIENT, start);
        }

        state.clear(CLIENT);
        let record = state.record(&CLIENT).expect("record kept after clear");
        assert_eq!(record.attempts, 0);

        assert_eq!(state.validate(CLIENT, start), Verdict::Allow);
        assert_eq!(state.record(&CLIENT).map(|r| r.attempts), Some(1));
        assert_eq!(state.validate(CLIENT, start), Verdict::Allow);
        assert_eq!(state.validate(CLIENT, start), Verdict::Deny { attempts: 3 });
    }

    #[test]
    fn sweep_removes_only_records_past_retention() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(2), start);
        let stale = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        state.validate(stale, start);
        state.validate(CLIENT, start + minutes(20));

        assert_eq!(state.sweep(start + minutes(31)), 1);
        assert!(state.record(&stale).is_none());
        assert!(state.record(&CLIENT).is_some());

        // Sweeping more often never evicts a recent record.
        for offset in 32..50 {
            assert_eq!(state.sweep(start + minutes(offset)), 0);
        }
        assert!(state.record(&CLIENT).is_some());
    }

    #[test]
    fn validate_runs_sweep_once_interval_elapsed() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(2), start);
        let stale = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        state.validate(stale, start);

        state.validate(CLIENT, start + minutes(5));
        assert_eq!(state.len(), 2, "no sweep before the interval");

        state.validate(CLIENT, start + minutes(31));
        assert_eq!(state.len(), 1);
        assert!(state.record(&stale).is_none());
    }

    #[test]
    fn swept_identity_starts_counting_again() {
        let start = Instant::now();
        let mut state = TrackerState::new(config(2), start);
        for _ in 0..3 {
            state.validate(CLIENT, start);
        }

        let later = start + minutes(31);
        assert_eq!(state.validate(CLIENT, later), Verdict::Allow);
        assert_eq!(state.validate(CLIENT, later), Verdict::Allow);
    }

    #[tokio::test]
    async fn handle_serializes_concurrent_validations() {
        let tracker = ConnectionTracker::spawn(config(5));
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move { tracker.validate(Some(CLIENT), false).await }));
        }

        let mut allowed = 0;
        let mut denied = 0;
        for task in tasks {
            match task.await.expect("join") {
                Ok(Verdict::Allow) => allowed += 1,
                Ok(Verdict::Deny { .. }) => denied += 1,
                Err(err) => panic!("unexpected tracker error: {err}"),
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(denied, 15);
    }

    #[tokio::test]
    async fn concurrent_authenticated_attempts_are_never_denied() {
        let tracker = ConnectionTracker::spawn(config(1));
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move { tracker.validate(Some(CLIENT), true).await }));
        }

        for task in tasks {
            assert_eq!(task.await.expect("join"), Ok(Verdict::Allow));
        }
    }

    #[tokio::test]
    async fn valid_token_is_still_denied_over_the_limit() {
        let tracker = ConnectionTracker::spawn(config(1));
        assert_eq!(tracker.validate(Some(CLIENT), false).await, Ok(Verdict::Allow));
        assert!(matches!(
            tracker.validate(Some(CLIENT), true).await,
            Ok(Verdict::Deny { .. })
        ));
    }

    #[tokio::test]
    async fn unidentified_source_is_not_counted() {
        let tracker = ConnectionTracker::spawn(config(1));
        for _ in 0..3 {
            assert_eq!(
                tracker.validate(None, false).await,
                Err(TrackerError::UnidentifiedSource)
            );
        }
        assert_eq!(tracker.validate(Some(CLIENT), false).await, Ok(Verdict::Allow));
    }

    #[tokio::test(start_paused = true)]
    async fn denial_is_throttled() {
        let tracker = ConnectionTracker::spawn(TrackerConfig::new(1));
        tracker.validate(Some(CLIENT), false).await.expect("first attempt");

        let started = Instant::now();
        let verdict = tracker.validate(Some(CLIENT), false).await.expect("second attempt");
        assert!(matches!(verdict, Verdict::Deny { attempts: 2 }));
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_does_not_stall_worker() {
        let tracker = ConnectionTracker::spawn(TrackerConfig::new(0));
        tracker.validate(Some(CLIENT), false).await.expect("first attempt");

        // The denied caller is dropped while it sleeps the throttle.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            tracker.validate(Some(CLIENT), false),
        )
        .await;
        assert!(cancelled.is_err());

        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2));
        assert_eq!(tracker.validate(Some(other), false).await, Ok(Verdict::Allow));
    }
}
