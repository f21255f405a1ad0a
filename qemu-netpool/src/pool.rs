//! The pool itself: construction, leasing, and one-shot disposal.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::command::{CommandError, Privilege, RealRunner, ShellRunner};
use crate::dnsmasq::DnsmasqSupervisor;
use crate::entry::{self, Entry, MAX_ENTRIES};
use crate::error::PoolError;
use crate::handler::MetadataHandler;
use crate::prerequisites::check_prerequisites;
use crate::ruleset;
use crate::server::{Entries, MetadataServer};

const METADATA_IP: &str = "169.254.169.254";

/// Size of a [`Pool`] to construct.
pub struct PoolConfig {
    pub size: usize,
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

struct Inner {
    entries: Arc<Entries>,
    dnsmasq: DnsmasqSupervisor,
    server: Mutex<Option<MetadataServer>>,
    runner: Arc<dyn ShellRunner>,
    active: AtomicBool,
}

/// Owns a fixed set of TAP/subnet pairs plus the `dnsmasq` and metadata
/// HTTP subsystems that serve them. Constructed once with a size; leased
/// and released per guest; torn down exactly once with [`Pool::dispose`].
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    /// Provision `config.size` networks, start `dnsmasq`, and start the
    /// metadata HTTP server.
    ///
    /// # Errors
    /// Returns [`PoolError::Unavailable`] if a required command is
    /// missing or sudo is unreachable, and [`PoolError::Setup`] if any
    /// step of provisioning fails — any partial state already created is
    /// rolled back best-effort before the error is returned.
    pub async fn new(config: PoolConfig) -> Result<Pool, PoolError> {
        Self::new_with_runner(config, Arc::new(RealRunner)).await
    }

    pub(crate) async fn new_with_runner(
        config: PoolConfig,
        runner: Arc<dyn ShellRunner>,
    ) -> Result<Pool, PoolError> {
        check_prerequisites(runner.as_ref(), config.size).await?;
        Self::construct(config, runner).await
    }

    /// Provisioning logic shared by [`Pool::new_with_runner`] and tests —
    /// tests skip the host-capability check since a fake runner makes it
    /// meaningless (there's no real `ip`/`iptables`/`dnsmasq` to find).
    async fn construct(config: PoolConfig, runner: Arc<dyn ShellRunner>) -> Result<Pool, PoolError> {
        if config.size > MAX_ENTRIES {
            return Err(PoolError::Setup(format!(
                "pool size {} exceeds the maximum of {MAX_ENTRIES}",
                config.size
            )));
        }

        run_forwarding_sysctl(runner.as_ref()).await?;

        let mut created: Vec<Arc<Entry>> = Vec::with_capacity(config.size);
        let mut map = HashMap::with_capacity(config.size);
        for i in 0..config.size {
            let tap = entry::tap_name(i);
            let prefix = entry::ip_prefix(i);
            if let Err(e) = install_entry(runner.as_ref(), &tap, &prefix).await {
                rollback_entries(runner.as_ref(), &created).await;
                return Err(PoolError::Setup(format!("failed to create entry {tap}: {e}")));
            }
            let entry = Arc::new(Entry::new(tap, prefix.clone()));
            created.push(Arc::clone(&entry));
            map.insert(prefix, entry);
        }

        let prefixes: Vec<String> = created.iter().map(|e| e.ip_prefix.clone()).collect();
        if let Err(e) = install_isolation(runner.as_ref(), &prefixes).await {
            rollback_entries(runner.as_ref(), &created).await;
            return Err(PoolError::Setup(format!("failed to install isolation rules: {e}")));
        }

        if let Err(e) = runner
            .run_script(
                &[vec!["ip".to_string(), "addr".to_string(), "add".to_string(), METADATA_IP.to_string(), "dev".to_string(), "lo".to_string()]],
                Privilege::Sudo,
            )
            .await
        {
            rollback_entries(runner.as_ref(), &created).await;
            return Err(PoolError::Setup(format!("failed to assign metadata address to loopback: {e}")));
        }

        let dnsmasq_entries: Vec<(String, String)> = created
            .iter()
            .map(|e| (e.tap_name.clone(), e.ip_prefix.clone()))
            .collect();
        let dnsmasq = match DnsmasqSupervisor::start(&dnsmasq_entries).await {
            Ok(d) => d,
            Err(e) => {
                rollback_entries(runner.as_ref(), &created).await;
                return Err(e);
            }
        };

        let entries: Arc<Entries> = Arc::new(Mutex::new(Some(map)));
        let server = match MetadataServer::start(Arc::clone(&entries)).await {
            Ok(s) => s,
            Err(e) => {
                dnsmasq.kill_and_wait().await;
                rollback_entries(runner.as_ref(), &created).await;
                return Err(e);
            }
        };

        info!(size = config.size, "network pool ready");

        Ok(Pool {
            inner: Arc::new(Inner {
                entries,
                dnsmasq,
                server: Mutex::new(Some(server)),
                runner,
                active: AtomicBool::new(true),
            }),
        })
    }

    /// Lease an idle network, or `None` if every entry is in use.
    ///
    /// # Panics
    /// Panics if called after [`Pool::dispose`] — that indicates a bug in
    /// the caller, not an environmental fault.
    #[allow(clippy::panic)]
    pub async fn acquire(&self) -> Option<Network> {
        let entry = {
            let guard = self.inner.entries.lock().await;
            let map = match guard.as_ref() {
                Some(map) => map,
                None => panic!("Pool::acquire called after dispose"),
            };
            let found = map.values().find(|e| !e.is_in_use()).map(Arc::clone);
            if let Some(ref e) = found {
                e.mark_in_use();
            }
            found
        }?;

        // Idle entries already have an empty handler slot by invariant;
        // clearing it again is a cheap no-op that keeps the guarantee
        // explicit rather than assumed.
        entry.set_handler(None).await;

        info!(tap = %entry.tap_name, "network leased");

        Some(Network {
            pool: Arc::clone(&self.inner),
            tap_name: entry.tap_name.clone(),
            entry,
            released: Mutex::new(false),
        })
    }

    /// Tear down every entry, `dnsmasq`, and the metadata server.
    ///
    /// # Panics
    /// Panics if called more than once, or while a lease is still
    /// outstanding — both are programmer errors.
    #[allow(clippy::panic)]
    pub async fn dispose(&self) -> Result<(), PoolError> {
        {
            let guard = self.inner.entries.lock().await;
            let map = match guard.as_ref() {
                Some(map) => map,
                None => panic!("Pool::dispose called more than once"),
            };
            if map.values().any(Entry::is_in_use) {
                panic!("Pool::dispose called with a lease still outstanding");
            }
        }

        let server = self.inner.server.lock().await.take();
        match server {
            Some(server) => server.stop().await,
            None => panic!("Pool::dispose called more than once"),
        }

        self.inner.dnsmasq.kill_and_wait().await;

        let map = {
            let mut guard = self.inner.entries.lock().await;
            match guard.take() {
                Some(map) => map,
                None => panic!("Pool::dispose called more than once"),
            }
        };

        let prefixes: Vec<String> = map.values().map(|e| e.ip_prefix.clone()).collect();
        let mut errors: Vec<CommandError> = uninstall_isolation(self.inner.runner.as_ref(), &prefixes).await;
        for entry in map.values() {
            errors.extend(teardown_entry(self.inner.runner.as_ref(), entry).await);
        }

        let loopback_result = self
            .inner
            .runner
            .run_script(
                &[vec!["ip".to_string(), "addr".to_string(), "del".to_string(), METADATA_IP.to_string(), "dev".to_string(), "lo".to_string()]],
                Privilege::Sudo,
            )
            .await;

        self.inner.active.store(false, Ordering::SeqCst);

        if !errors.is_empty() {
            let joined = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            return Err(PoolError::Teardown(joined));
        }

        loopback_result.map_err(|e| PoolError::Teardown(e.to_string()))
    }
}

#[cfg(test)]
impl Pool {
    /// Like [`Pool::construct`], but substitutes no-op `dnsmasq` and
    /// metadata-server doubles so the test host needs neither a real
    /// `dnsmasq` binary nor the metadata address configured on `lo`.
    async fn construct_for_test(config: PoolConfig, runner: Arc<dyn ShellRunner>) -> Result<Pool, PoolError> {
        if config.size > MAX_ENTRIES {
            return Err(PoolError::Setup(format!(
                "pool size {} exceeds the maximum of {MAX_ENTRIES}",
                config.size
            )));
        }

        run_forwarding_sysctl(runner.as_ref()).await?;

        let mut created: Vec<Arc<Entry>> = Vec::with_capacity(config.size);
        let mut map = HashMap::with_capacity(config.size);
        for i in 0..config.size {
            let tap = entry::tap_name(i);
            let prefix = entry::ip_prefix(i);
            install_entry(runner.as_ref(), &tap, &prefix).await.map_err(|e| PoolError::Setup(e.to_string()))?;
            let entry = Arc::new(Entry::new(tap, prefix.clone()));
            created.push(Arc::clone(&entry));
            map.insert(prefix, entry);
        }

        let prefixes: Vec<String> = created.iter().map(|e| e.ip_prefix.clone()).collect();
        install_isolation(runner.as_ref(), &prefixes).await.map_err(|e| PoolError::Setup(e.to_string()))?;

        let entries: Arc<Entries> = Arc::new(Mutex::new(Some(map)));

        Ok(Pool {
            inner: Arc::new(Inner {
                entries,
                dnsmasq: DnsmasqSupervisor::noop_for_test(),
                server: Mutex::new(Some(MetadataServer::noop_for_test())),
                runner,
                active: AtomicBool::new(true),
            }),
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.active.load(Ordering::SeqCst) {
            warn!("Pool dropped without calling dispose()");
        }
    }
}

/// A leased network: one TAP device, borrowed for as long as the guest
/// that owns it runs.
pub struct Network {
    pool: Arc<Inner>,
    entry: Arc<Entry>,
    tap_name: String,
    released: Mutex<bool>,
}

impl Network {
    /// Name of the TAP device QEMU should bind its NIC to.
    pub fn tap_device(&self) -> &str {
        &self.tap_name
    }

    /// Install the handler the metadata server dispatches to for this
    /// lease's source-IP prefix.
    ///
    /// # Panics
    /// Panics if this lease has already been released.
    #[allow(clippy::panic)]
    pub async fn set_handler(&self, handler: Arc<dyn MetadataHandler>) {
        let guard = self.released.lock().await;
        if *guard {
            panic!("Network::set_handler called on an already-released lease");
        }
        drop(guard);
        self.entry.set_handler(Some(handler)).await;
    }

    /// Return this lease to the pool. Clears the handler slot before
    /// marking the entry idle, so no dispatch in flight can observe a
    /// stale handler after release completes.
    ///
    /// Takes `&self` rather than consuming the lease, matching
    /// `set_handler`/`tap_device`, so that calling anything on an
    /// already-released lease is a runtime check, not something the type
    /// system rules out — a second `release()` or a `set_handler()` after
    /// release is a programmer error caught by the `released` guard below.
    ///
    /// # Panics
    /// Panics on a second call — double-release is a programmer error.
    #[allow(clippy::panic)]
    pub async fn release(&self) {
        let mut guard = self.released.lock().await;
        if *guard {
            panic!("Network::release called more than once");
        }
        *guard = true;
        drop(guard);

        self.entry.set_handler(None).await;

        let pool_guard = self.pool.entries.lock().await;
        self.entry.mark_idle();
        drop(pool_guard);

        info!(tap = %self.entry.tap_name, "network released");
    }
}

async fn run_forwarding_sysctl(runner: &dyn ShellRunner) -> Result<(), PoolError> {
    runner
        .run_script(
            &[vec!["sysctl".to_string(), "-w".to_string(), "net.ipv4.ip_forward=1".to_string()]],
            Privilege::Sudo,
        )
        .await
        .map_err(|e| PoolError::Setup(format!("failed to enable ipv4 forwarding: {e}")))
}

fn entry_setup_commands(tap: &str, prefix: &str) -> Vec<Vec<String>> {
    vec![
        vec!["ip".to_string(), "tuntap".to_string(), "add".to_string(), "dev".to_string(), tap.to_string(), "mode".to_string(), "tap".to_string()],
        vec!["ip".to_string(), "addr".to_string(), "add".to_string(), format!("{prefix}.1"), "dev".to_string(), tap.to_string()],
        vec!["ip".to_string(), "link".to_string(), "set".to_string(), "dev".to_string(), tap.to_string(), "up".to_string()],
        vec!["ip".to_string(), "route".to_string(), "add".to_string(), format!("{prefix}.0/24"), "dev".to_string(), tap.to_string()],
    ]
}

fn entry_teardown_commands(tap: &str, prefix: &str) -> Vec<Vec<String>> {
    vec![
        vec!["ip".to_string(), "route".to_string(), "del".to_string(), format!("{prefix}.0/24"), "dev".to_string(), tap.to_string()],
        vec!["ip".to_string(), "link".to_string(), "set".to_string(), "dev".to_string(), tap.to_string(), "down".to_string()],
        vec!["ip".to_string(), "addr".to_string(), "del".to_string(), format!("{prefix}.1"), "dev".to_string(), tap.to_string()],
        vec!["ip".to_string(), "tuntap".to_string(), "del".to_string(), "dev".to_string(), tap.to_string(), "mode".to_string(), "tap".to_string()],
    ]
}

async fn install_entry(runner: &dyn ShellRunner, tap: &str, prefix: &str) -> Result<(), CommandError> {
    let mut commands = entry_setup_commands(tap, prefix);
    commands.extend(ruleset::entry_install_rules(tap, prefix));
    runner.run_script(&commands, Privilege::Sudo).await
}

async fn teardown_entry(runner: &dyn ShellRunner, entry: &Entry) -> Vec<CommandError> {
    let mut commands = ruleset::entry_uninstall_rules(&entry.tap_name, &entry.ip_prefix);
    commands.extend(entry_teardown_commands(&entry.tap_name, &entry.ip_prefix));
    runner.run_best_effort(&commands, Privilege::Sudo).await
}

async fn install_isolation(runner: &dyn ShellRunner, prefixes: &[String]) -> Result<(), CommandError> {
    if prefixes.len() < 2 {
        return Ok(());
    }
    runner.run_script(&ruleset::isolation_install_rules(prefixes), Privilege::Sudo).await
}

async fn uninstall_isolation(runner: &dyn ShellRunner, prefixes: &[String]) -> Vec<CommandError> {
    if prefixes.len() < 2 {
        return Vec::new();
    }
    runner.run_best_effort(&ruleset::isolation_uninstall_rules(prefixes), Privilege::Sudo).await
}

async fn rollback_entries(runner: &dyn ShellRunner, created: &[Arc<Entry>]) {
    for entry in created.iter().rev() {
        let errors = teardown_entry(runner, entry).await;
        for e in errors {
            warn!(tap = %entry.tap_name, error = %e, "rollback: failed to remove a partially-installed entry");
        }
    }
}
