// ===============================
// src/store.rs (single-writer ledger store)
// ===============================
//
// The in-memory ledger sits behind one async mutex. Every mutation:
//   1) runs under the lock (idempotency check + transition are atomic)
//   2) writes the next ledger to `<file>.tmp`, fsyncs, renames over the file
//   3) swaps the in-memory ledger only after the snapshot landed
//   4) appends an audit line while still holding the lock (failure logged, not propagated)
// Steps 2-4 run on a spawned task that owns the guard, so a dropped caller
// cannot leave disk and memory apart.
//
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, OwnedMutexGuard},
};
use tracing::{error, info, warn};

use crate::config::StoreCfg;
use crate::domain::{
    normalize_symbol, AuditEvent, AuditKind, Ledger, Order, OrderInput, OrderType, Policy,
    PolicyPatch,
};
use crate::engine::Execution;
use crate::error::{Error, Result};
use crate::recorder::AuditLog;

/// Outcome of `commit_order`.
#[derive(Debug, Clone)]
pub enum Commit {
    /// First acceptance of this command; the ledger moved.
    Executed(Box<Execution>),
    /// Key seen before; the stored order is returned verbatim.
    Replayed(Order),
}

impl Commit {
    pub fn order(&self) -> &Order {
        match self {
            Commit::Executed(e) => &e.order,
            Commit::Replayed(o) => o,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            Commit::Executed(e) => e.order,
            Commit::Replayed(o) => o,
        }
    }
}

pub struct LedgerStore {
    path: PathBuf,
    ledger: Arc<Mutex<Ledger>>,
    audit: Arc<AuditLog>,
}

impl LedgerStore {
    /// Load `<account>.ledger.json`, or create and persist a fresh ledger.
    pub async fn open(cfg: &StoreCfg) -> Result<Self> {
        Self::open_at(cfg.ledger_path(), cfg.audit_path(), cfg.starting_cash_cents, Utc::now()).await
    }

    pub async fn open_at(
        path: PathBuf,
        audit_path: PathBuf,
        starting_cash_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let ledger = match fs::read(&path).await {
            Ok(bytes) => {
                let ledger: Ledger = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    orders = ledger.orders.len(),
                    positions = ledger.positions.len(),
                    "store: ledger loaded"
                );
                ledger
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let ledger = Ledger::new(starting_cash_cents, now);
                write_snapshot(&path, &ledger).await?;
                info!(path = %path.display(), starting_cash_cents, "store: new ledger created");
                ledger
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            ledger: Arc::new(Mutex::new(ledger)),
            audit: Arc::new(AuditLog::new(audit_path)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Consistent copy of the current ledger.
    pub async fn snapshot(&self) -> Ledger {
        self.ledger.lock().await.clone()
    }

    /// Read-only lookup; the authoritative check happens again inside `commit_order`.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Option<Order> {
        self.ledger.lock().await.find_by_idempotency_key(key).cloned()
    }

    /// Check-then-act under the writer lock: replay a prior order for `key`, or run
    /// `transition` on the current ledger and persist its result.
    pub async fn commit_order<F>(
        &self,
        key: Option<&str>,
        input: &OrderInput,
        transition: F,
    ) -> Result<Commit>
    where
        F: FnOnce(&Ledger) -> Execution,
    {
        let guard = self.ledger.clone().lock_owned().await;

        if let Some(key) = key {
            if let Some(prior) = guard.find_by_idempotency_key(key).cloned() {
                if !same_payload(&prior, input) {
                    warn!(
                        idempotency_key = %key,
                        order_id = %prior.id,
                        "store: idempotency key reused with a different payload, replaying original"
                    );
                }
                let ev = AuditEvent::for_order(AuditKind::OrderIdempotentReplay, Utc::now(), &prior, None);
                append_audit(&self.audit, &ev).await;
                return Ok(Commit::Replayed(prior));
            }
        }

        let exec = transition(&*guard);
        let ev = AuditEvent::for_order(
            AuditKind::OrderExecuted,
            exec.order.requested_at,
            &exec.order,
            Some(exec.risk.level),
        );
        self.persist(guard, exec.ledger.clone(), ev).await?;
        Ok(Commit::Executed(Box::new(exec)))
    }

    /// Validate and merge, persist, then audit. Invalid patches leave the ledger untouched.
    pub async fn update_policy(&self, patch: &PolicyPatch, now: DateTime<Utc>) -> Result<Policy> {
        let guard = self.ledger.clone().lock_owned().await;
        let policy = guard.policy.merged(patch)?;

        let mut next = guard.clone();
        next.policy = policy.clone();
        next.updated_at = now;
        self.persist(guard, next, AuditEvent::policy_updated(now)).await?;

        info!(
            kill_switch = policy.kill_switch_enabled,
            allow_short = policy.allow_short,
            blocked = policy.blocked_symbols.len(),
            "store: policy updated"
        );
        Ok(policy)
    }

    /// Snapshot, swap and audit on a task of their own; the caller only waits for it.
    async fn persist(&self, mut guard: OwnedMutexGuard<Ledger>, next: Ledger, ev: AuditEvent) -> Result<()> {
        let path = self.path.clone();
        let audit = self.audit.clone();
        tokio::spawn(async move {
            write_snapshot(&path, &next).await?;
            *guard = next;
            append_audit(&audit, &ev).await;
            Ok::<(), Error>(())
        })
        .await?
    }
}

async fn append_audit(audit: &AuditLog, ev: &AuditEvent) {
    if let Err(e) = audit.append(ev).await {
        error!(?e, kind = ?ev.kind, "store: audit append failed");
    }
}

fn same_payload(prior: &Order, input: &OrderInput) -> bool {
    let limit = input.limit_price_cents.filter(|_| input.order_type == OrderType::Limit);
    prior.symbol == normalize_symbol(&input.symbol)
        && prior.side == input.side
        && prior.quantity == input.quantity
        && prior.order_type == input.order_type
        && prior.limit_price_cents == limit
}

/// Write-temp-then-rename so a crash never leaves a half-written ledger.
async fn write_snapshot(path: &Path, ledger: &Ledger) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let bytes = serde_json::to_vec_pretty(ledger)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut f = File::create(&tmp).await?;
    f.write_all(&bytes).await?;
    f.sync_all().await?;
    drop(f);
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSource, PlaceOptions, Quote, Side};
    use crate::engine::{execute, ExecContext};
    use crate::pricing::Marks;
    use futures_util::FutureExt;

    async fn open(dir: &Path) -> LedgerStore {
        LedgerStore::open_at(dir.join("t.ledger.json"), dir.join("t.audit.jsonl"), 10_000_000, Utc::now())
            .await
            .unwrap()
    }

    fn fill(ledger: &Ledger, input: &OrderInput, key: Option<&str>, id: &str) -> Execution {
        let q = Quote { symbol: "AAPL".into(), price_cents: 10_000, source: "test".into(), as_of: Utc::now() };
        let marks = Marks::new();
        let opts = PlaceOptions { idempotency_key: key.map(String::from), source: OrderSource::Api };
        let ctx = ExecContext { order_id: id.into(), now: Utc::now(), quote: &q, marks: &marks };
        execute(ledger, input, &opts, &ctx)
    }

    #[tokio::test]
    async fn creates_and_reloads_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        assert!(store.path().exists());

        let input = OrderInput::market("AAPL", Side::Buy, 3.0);
        store.commit_order(None, &input, |l| fill(l, &input, None, "o1")).await.unwrap();
        drop(store);

        let again = open(dir.path()).await;
        let l = again.snapshot().await;
        assert_eq!(l.position_qty("AAPL"), 3.0);
        assert_eq!(l.orders[0].id, "o1");
        assert!(!dir.path().join("t.ledger.json.tmp").exists());
    }

    #[tokio::test]
    async fn replay_does_not_run_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let input = OrderInput::market("AAPL", Side::Buy, 1.0);

        let first = store.commit_order(Some("k1"), &input, |l| fill(l, &input, Some("k1"), "o1")).await.unwrap();
        assert!(matches!(first, Commit::Executed(_)));

        let second = store
            .commit_order(Some("k1"), &input, |_| panic!("transition must not run on replay"))
            .await
            .unwrap();
        assert!(matches!(second, Commit::Replayed(_)));
        assert_eq!(first.order(), second.order());
        assert_eq!(store.snapshot().await.orders.len(), 1);

        let kinds: Vec<AuditKind> = store.audit().read_all().await.unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::OrderExecuted, AuditKind::OrderIdempotentReplay]);
    }

    #[tokio::test]
    async fn invalid_policy_patch_is_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let bad = PolicyPatch { max_drawdown_pct: Some(0.0), ..Default::default() };
        assert!(store.update_policy(&bad, Utc::now()).await.is_err());
        assert_eq!(store.snapshot().await.policy, Policy::default());

        let ok = PolicyPatch { allow_short: Some(true), ..Default::default() };
        let p = store.update_policy(&ok, Utc::now()).await.unwrap();
        assert!(p.allow_short);
        assert!(open(dir.path()).await.snapshot().await.policy.allow_short);
    }

    #[tokio::test]
    async fn dropped_caller_still_completes_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let input = OrderInput::market("AAPL", Side::Buy, 2.0);

        // give up on the commit right after its first poll
        let commit = store.commit_order(Some("k-drop"), &input, |l| fill(l, &input, Some("k-drop"), "o-drop"));
        assert!(commit.now_or_never().is_none());

        // the lock is released only once the detached commit finished
        let mem = store.snapshot().await;
        assert_eq!(mem.orders.len(), 1);
        assert_eq!(mem.position_qty("AAPL"), 2.0);

        let disk: Ledger = serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(disk, mem);
        let kinds: Vec<AuditKind> = store.audit().read_all().await.unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::OrderExecuted]);

        // the next commit builds on the same ledger
        let again = store.commit_order(Some("k-drop"), &input, |_| panic!("already committed")).await.unwrap();
        assert_eq!(again.order().id, "o-drop");
    }
}
