use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use plume_model::Ticket;
use tracing::{debug, info, instrument, trace, warn};

use super::{client::RegistryClient, registry::RegistryConfig, server::RegistryServer};
use crate::{
    error::LockError,
    locker::{Locker, LockerKind, Slot},
    pid::ProcessTable,
};

#[derive(Debug, Clone)]
pub struct TicketLockConfig {
    pub lock_name: String,
    /// Registry host. A bootstrapped registry binds this address when it is an IP literal.
    pub host: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub description: Option<String>,
    /// Timeouts of a registry bootstrapped by this locker.
    pub registry: RegistryConfig,
    pub request_timeout: Duration,
}

impl Default for TicketLockConfig {
    fn default() -> Self {
        Self {
            lock_name: "plume".into(),
            host: "127.0.0.1".into(),
            port: 7311,
            poll_interval: Duration::from_secs(5),
            description: None,
            registry: RegistryConfig::default(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Fair multi-host lock arbitrated by a ticket registry.
///
/// When no registry answers, the locker starts one itself and keeps it running for as long as the
/// locker lives. Concurrent bootstraps are serialized by the optional `bootstrap_guard`; without
/// one, the loser of a bind race simply uses the winner's registry.
///
/// A holder stops polling: the registry revokes its ticket once `max_working` has elapsed since
/// it was elected.
pub struct TicketLocker {
    cfg: TicketLockConfig,
    client: RegistryClient,
    processes: Arc<dyn ProcessTable>,
    bootstrap_guard: Option<Arc<dyn Locker>>,
    hosted: tokio::sync::Mutex<Option<RegistryServer>>,
    held: Slot<Ticket>,
}

fn valid_lock_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn granted(tickets: &[Ticket], mine: &Ticket) -> bool {
    match tickets {
        [only] => only == mine,
        _ => tickets.iter().any(|t| t == mine && t.working),
    }
}

impl TicketLocker {
    pub fn new(cfg: TicketLockConfig, processes: Arc<dyn ProcessTable>) -> Result<Self, LockError> {
        if !valid_lock_name(&cfg.lock_name) {
            return Err(LockError::InvalidConfig(format!(
                "ticket lock name '{}' must only use [A-Za-z0-9._-]",
                cfg.lock_name
            )));
        }
        let client = RegistryClient::new(format!("{}:{}", cfg.host, cfg.port), cfg.request_timeout)?;
        Ok(Self {
            cfg,
            client,
            processes,
            bootstrap_guard: None,
            hosted: tokio::sync::Mutex::new(None),
            held: Slot::new(),
        })
    }

    /// Serialize registry bootstraps with `guard`.
    pub fn with_bootstrap_guard(mut self, guard: Arc<dyn Locker>) -> Self {
        self.bootstrap_guard = Some(guard);
        self
    }

    pub fn is_held(&self) -> bool {
        self.held.is_held()
    }

    /// Address of the registry this locker hosts, if it bootstrapped one.
    pub async fn hosted_addr(&self) -> Option<SocketAddr> {
        self.hosted.lock().await.as_ref().map(RegistryServer::local_addr)
    }

    fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .cfg
            .host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.cfg.port)
    }

    async fn bootstrap(&self) -> Result<(), LockError> {
        let mut hosted = self.hosted.lock().await;
        if hosted.is_some() {
            return Ok(());
        }

        let Some(guard) = &self.bootstrap_guard else {
            warn!(lock = %self.cfg.lock_name, "bootstrapping ticket registry without a guard");
            return self.start_registry(&mut hosted).await;
        };

        guard.lock().await?;
        let started = self.start_registry(&mut hosted).await;
        let released = guard.unlock().await;
        started.and(released)
    }

    /// Start a registry unless one answers by now.
    async fn start_registry(&self, hosted: &mut Option<RegistryServer>) -> Result<(), LockError> {
        match self.client.tickets(&self.cfg.lock_name).await {
            Ok(_) => {
                debug!(lock = %self.cfg.lock_name, "registry appeared before bootstrap");
                return Ok(());
            }
            Err(LockError::RegistryUnreachable { .. }) => {}
            Err(e) => return Err(e),
        }

        let addr = self.bind_addr();
        match RegistryServer::bind(addr, self.cfg.registry.clone(), Arc::clone(&self.processes)).await
        {
            Ok(server) => {
                info!(lock = %self.cfg.lock_name, addr = %server.local_addr(), "bootstrapped ticket registry");
                *hosted = Some(server);
                Ok(())
            }
            Err(LockError::Bind { source, .. })
                if source.kind() == std::io::ErrorKind::AddrInUse =>
            {
                debug!(lock = %self.cfg.lock_name, %addr, "another process bootstrapped the registry");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_turn(&self, ticket: &Ticket) -> Result<(), LockError> {
        let mut unreachable = 0u32;
        loop {
            match self.client.get_tickets(&self.cfg.lock_name, ticket).await {
                Ok(tickets) if granted(&tickets, ticket) => return Ok(()),
                Ok(tickets) => {
                    unreachable = 0;
                    trace!(lock = %self.cfg.lock_name, queued = tickets.len(), "waiting for turn");
                }
                Err(LockError::RegistryUnreachable { addr, reason }) => {
                    unreachable += 1;
                    debug!(lock = %self.cfg.lock_name, %addr, %reason, "ticket registry unreachable");
                    self.bootstrap().await?;
                    if unreachable == 1 {
                        continue;
                    }
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}

#[async_trait]
impl Locker for TicketLocker {
    fn name(&self) -> &str {
        &self.cfg.lock_name
    }

    fn kind(&self) -> LockerKind {
        LockerKind::Ticket
    }

    #[instrument(level = "debug", skip(self), fields(lock = %self.cfg.lock_name))]
    async fn lock(&self) -> Result<(), LockError> {
        let Some(acquiring) = self.held.begin(&self.cfg.lock_name)? else {
            return Ok(());
        };

        let ticket = Ticket::new(self.cfg.description.clone());
        if let Err(e) = self.wait_turn(&ticket).await {
            if let Err(cleanup) = self.client.end_work(&self.cfg.lock_name, &ticket).await {
                debug!(error = %cleanup, "could not withdraw ticket");
            }
            return Err(e);
        }

        debug!(%ticket, "ticket lock acquired");
        acquiring.hold(ticket);
        Ok(())
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let Some(ticket) = self.held.take() else {
            return Ok(());
        };
        self.client.end_work(&self.cfg.lock_name, &ticket).await?;
        debug!(lock = %self.cfg.lock_name, %ticket, "ticket lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{FileLocker, pid::SystemProcesses};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> TicketLockConfig {
        TicketLockConfig {
            lock_name: "ingest".into(),
            port,
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn grant_rules() {
        let mine = Ticket::with_identity(1, 1, 10, 0);
        let other = Ticket::with_identity(2, 1, 5, 0);
        let mut working_other = other.clone();
        working_other.working = true;
        let mut working_mine = mine.clone();
        working_mine.working = true;

        assert!(granted(std::slice::from_ref(&mine), &mine));
        assert!(!granted(&[working_other.clone(), mine.clone()], &mine));
        assert!(granted(&[other, working_mine], &mine));
        assert!(!granted(&[], &mine));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_is_served_when_holder_ends_work() {
        let server = RegistryServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            RegistryConfig::default(),
            Arc::new(SystemProcesses),
        )
        .await
        .unwrap();
        let port = server.local_addr().port();
        let a = TicketLocker::new(config(port), Arc::new(SystemProcesses)).unwrap();
        let b = Arc::new(TicketLocker::new(config(port), Arc::new(SystemProcesses)).unwrap());

        a.lock().await.unwrap();
        assert!(a.hosted_addr().await.is_none());

        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());
        assert_eq!(server.service().registry("ingest").snapshot().len(), 2);

        a.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("b should be served")
            .unwrap()
            .unwrap();

        b.unlock().await.unwrap();
        assert!(server.service().registry("ingest").snapshot().is_empty());
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_lock_call_during_acquisition_is_rejected() {
        let server = RegistryServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            RegistryConfig::default(),
            Arc::new(SystemProcesses),
        )
        .await
        .unwrap();
        let port = server.local_addr().port();
        let holder = TicketLocker::new(config(port), Arc::new(SystemProcesses)).unwrap();
        let contender = Arc::new(TicketLocker::new(config(port), Arc::new(SystemProcesses)).unwrap());
        holder.lock().await.unwrap();

        let waiting = {
            let contender = Arc::clone(&contender);
            tokio::spawn(async move { contender.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            contender.lock().await,
            Err(LockError::AcquireInProgress(_))
        ));
        assert_eq!(server.service().registry("ingest").snapshot().len(), 2);

        holder.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("contender should be served")
            .unwrap()
            .unwrap();
        contender.unlock().await.unwrap();
        assert!(server.service().registry("ingest").snapshot().is_empty());
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_locker_bootstraps_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let inside = Arc::new(AtomicBool::new(false));

        let mut lockers = Vec::new();
        for _ in 0..3 {
            let locker = TicketLocker::new(config(port), Arc::new(SystemProcesses))
                .unwrap()
                .with_bootstrap_guard(Arc::new(FileLocker::new(dir.path().join("bootstrap.flock"))));
            lockers.push(Arc::new(locker));
        }

        let mut tasks = Vec::new();
        for locker in &lockers {
            let locker = Arc::clone(locker);
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                locker.lock().await.unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_millis(30)).await;
                inside.store(false, Ordering::SeqCst);
                locker.unlock().await.unwrap();
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("every locker should be served")
                .unwrap();
        }

        let mut hosts = 0;
        for locker in &lockers {
            hosts += usize::from(locker.hosted_addr().await.is_some());
        }
        assert_eq!(hosts, 1);
    }

    #[test]
    fn lock_names_are_url_safe() {
        let cfg = TicketLockConfig {
            lock_name: "a/b".into(),
            ..Default::default()
        };
        assert!(matches!(
            TicketLocker::new(cfg, Arc::new(SystemProcesses)),
            Err(LockError::InvalidConfig(_))
        ));
    }
}
