//! The mDNS responder: claims names, announces services, answers
//! questions and retracts records on shutdown.

use crate::{
    conn::{next_request, Conn, InboundRequest, MdnsConn, OutResponse},
    errors::{ProbeError, RespondError},
    net::NetInterface,
    probe::{probe_service, reprobe_service, OwnRecords},
    records,
    service::Service,
    socket::MdnsSocket,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::{atomic::AtomicU64, Arc, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use trust_dns_client::{
    op::Query as DnsQuery,
    rr::Record as DnsRecord,
};

mod builder;
pub use builder::ResponderBuilder;

mod handle;
pub use handle::{ResponderHandle, ServiceHandle};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const GOODBYE_INTERVAL: Duration = Duration::from_millis(250);

/// Shared-record responses disperse over a random delay in this range
/// (RFC 6762 §6.3).
const SHARED_DELAY_MS: std::ops::RangeInclusive<u64> = 20..=125;

pub(crate) type TapFn = Box<dyn Fn(&InboundRequest) + Send + 'static>;

pub(crate) enum Command {
    Add {
        id: u64,
        service: Service,
        shared: Arc<RwLock<Service>>,
        reply: oneshot::Sender<Result<(), ProbeError>>,
    },
    Remove(u64),
    UpdateText(u64, BTreeMap<String, String>),
    Tap(TapFn),
    Registered(u64, Result<Service, ProbeError>),
    Reprobed(u64, Result<Service, ProbeError>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EntryState {
    /// Added before the responder started running.
    Pending,
    /// A probe task is verifying the names.
    Probing,
    /// Probed and announced, answering questions.
    Announced,
}

struct Entry {
    id: u64,
    state: EntryState,
    service: Service,
    shared: Arc<RwLock<Service>>,
}

/// Advertises services on the local link.
///
/// Services added before [`run`](Responder::run) are probed and announced
/// once the responder starts; services added through the
/// [`ResponderHandle`] afterwards are probed immediately. Shutting down
/// sends goodbye packets for everything still managed.
pub struct Responder {
    socket: Option<MdnsSocket>,
    conn_override: Option<Conn>,
    entries: Vec<Entry>,
    taps: Vec<TapFn>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    ids: Arc<AtomicU64>,
    rng: StdRng,
}

impl Responder {
    pub fn builder() -> ResponderBuilder {
        ResponderBuilder::new()
    }

    /// A responder over every multicast interface.
    pub fn new() -> Result<Self, RespondError> {
        ResponderBuilder::new().build()
    }

    pub(crate) fn from_parts(socket: Option<MdnsSocket>, conn_override: Option<Conn>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            socket,
            conn_override,
            entries: Vec::new(),
            taps: Vec::new(),
            cmd_tx,
            cmd_rx,
            ids: Arc::new(AtomicU64::new(1)),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub(crate) fn over(conn: Conn) -> Self {
        Self::from_parts(None, Some(conn))
    }

    /// Enqueues a service to be probed and announced when the responder
    /// starts.
    pub fn add(&mut self, service: Service) -> ServiceHandle {
        let id = self.next_id();
        let shared = Arc::new(RwLock::new(service.clone()));

        self.entries.push(Entry {
            id,
            state: EntryState::Pending,
            service,
            shared: shared.clone(),
        });

        ServiceHandle::new(id, self.cmd_tx.clone(), shared)
    }

    /// Drops a service added before startup. Unknown handles are a no-op.
    pub fn remove(&mut self, handle: &ServiceHandle) {
        self.entries.retain(|entry| entry.id != handle.id());
    }

    /// Registers a function called with a copy of every inbound request.
    pub fn debug<F>(&mut self, f: F)
    where
        F: Fn(&InboundRequest) + Send + 'static,
    {
        self.taps.push(Box::new(f));
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Runs the responder on the current thread until the process is
    /// interrupted. Goodbyes are sent for all managed services on exit.
    pub fn run(self) -> Result<(), RespondError> {
        tokio::runtime::Builder::new_current_thread()
            .thread_name("lantern mDNS responder (Tokio)")
            .enable_all()
            .build()
            .expect("tokio runtime")
            .block_on(self.impl_run(None))
    }

    /// Runs the responder on a background thread. The returned handle adds
    /// and removes services and shuts the responder down.
    pub fn run_in_background(self) -> ResponderHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let cmd_tx = self.cmd_tx.clone();
        let ids = self.ids.clone();

        let thread = std::thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .thread_name("lantern mDNS responder (Tokio)")
                .enable_all()
                .build()
                .expect("tokio runtime")
                .block_on(self.impl_run(Some(shutdown_rx)))
        });

        ResponderHandle::new(thread, shutdown_tx, cmd_tx, ids)
    }

    pub(crate) async fn impl_run(
        self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<(), RespondError> {
        let Responder {
            socket,
            conn_override,
            mut entries,
            taps,
            cmd_tx,
            cmd_rx,
            rng,
            ..
        } = self;

        let conn = match conn_override {
            Some(conn) => conn,
            None => {
                let socket = socket.expect("a responder without a test connection has a socket");
                Conn::Mdns(MdnsConn::new(socket.into_async()?))
            }
        };

        for entry in &mut entries {
            entry.state = EntryState::Probing;
        }

        let engine = Engine {
            conn: Arc::new(conn),
            entries,
            reprobing: HashMap::new(),
            replies: HashMap::new(),
            taps,
            truncated: HashMap::new(),
            cmd_tx,
            rng,
        };

        engine.run(cmd_rx, shutdown_rx).await
    }
}

struct Engine {
    conn: Arc<Conn>,
    entries: Vec<Entry>,
    /// Entries that lost their name to a conflict and are reprobing in a
    /// background task.
    reprobing: HashMap<u64, Entry>,
    replies: HashMap<u64, oneshot::Sender<Result<(), ProbeError>>>,
    taps: Vec<TapFn>,
    /// Truncated requests waiting for their continuation, by source
    /// address.
    truncated: HashMap<IpAddr, InboundRequest>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    rng: StdRng,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<(), RespondError> {
        let mut rx = self.conn.subscribe();

        // Register everything added before startup; a probe failure here
        // aborts the run, exactly like a failing post-start add would
        // surface the error to its caller.
        for index in 0..self.entries.len() {
            let service = self.entries[index].service.clone();
            let probed = probe_service(&self.conn, &service, &mut self.rng).await?;
            self.finish_registration(index, probed);
        }

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    rx.await.ok();
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    self.goodbye_all().await;
                    self.conn.close();
                    return Ok(());
                }

                cmd = cmd_rx.recv() => {
                    // The engine holds a sender itself, so the channel
                    // cannot close.
                    if let Some(cmd) = cmd {
                        self.handle_command(cmd).await;
                    }
                }

                req = next_request(&mut rx) => {
                    match req {
                        Some(req) => self.handle_request(req).await,
                        None => {
                            self.goodbye_all().await;
                            self.conn.close();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn finish_registration(&mut self, index: usize, probed: Service) {
        let entry = &mut self.entries[index];
        entry.service = probed.clone();
        *entry.shared.write().unwrap() = probed.clone();
        entry.state = EntryState::Announced;

        spawn_announcements(self.conn.clone(), vec![probed]);
    }

    fn announced_services(&self) -> Vec<Service> {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Announced)
            .map(|entry| entry.service.clone())
            .collect()
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add {
                id,
                service,
                shared,
                reply,
            } => {
                self.entries.push(Entry {
                    id,
                    state: EntryState::Probing,
                    service: service.clone(),
                    shared,
                });
                self.replies.insert(id, reply);
                self.spawn_probe(id, service, false);
            }

            Command::Registered(id, Ok(service)) => {
                if let Some(index) = self.entries.iter().position(|e| e.id == id) {
                    self.finish_registration(index, service);
                }
                if let Some(reply) = self.replies.remove(&id) {
                    reply.send(Ok(())).ok();
                }
            }

            Command::Registered(id, Err(err)) => {
                self.entries.retain(|entry| entry.id != id);
                if let Some(reply) = self.replies.remove(&id) {
                    reply.send(Err(err)).ok();
                }
            }

            Command::Reprobed(id, Ok(service)) => {
                if let Some(mut entry) = self.reprobing.remove(&id) {
                    entry.service = service.clone();
                    *entry.shared.write().unwrap() = service.clone();
                    entry.state = EntryState::Announced;
                    self.entries.push(entry);

                    debug!("reannouncing after reprobe");
                    spawn_announcements(self.conn.clone(), vec![service]);
                }
            }

            Command::Reprobed(id, Err(err)) => {
                // A service that cannot reclaim a name is silently dropped.
                debug!(%err, "reprobe failed, dropping service");
                self.reprobing.remove(&id);
            }

            Command::Remove(id) => {
                if let Some(index) = self.entries.iter().position(|e| e.id == id) {
                    let entry = self.entries.remove(index);
                    if entry.state == EntryState::Announced {
                        send_goodbyes(&self.conn, &[entry.service]).await;
                    }
                }
                self.reprobing.remove(&id);
            }

            Command::UpdateText(id, txt) => {
                if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
                    entry.service.txt = txt;
                    *entry.shared.write().unwrap() = entry.service.clone();

                    if entry.state == EntryState::Announced {
                        spawn_txt_announcement(self.conn.clone(), entry.service.clone());
                    }
                }
            }

            Command::Tap(tap) => self.taps.push(tap),
        }
    }

    async fn handle_request(&mut self, req: InboundRequest) {
        for tap in &self.taps {
            tap(&req);
        }

        if !self
            .entries
            .iter()
            .any(|entry| entry.state == EntryState::Announced)
        {
            return;
        }

        // A truncated message is held back until its continuation arrives
        // from the same source (RFC 6762 §18.5).
        if req.message().truncated() {
            debug!(from = %req.from(), "holding truncated message");
            self.truncated.insert(req.from().ip(), req);
            return;
        }

        let req = match self.truncated.remove(&req.from().ip()) {
            Some(first) => InboundRequest {
                msg: records::merge_truncated(first.message(), req.message()),
                from: req.from(),
                iface: req.iface().to_owned(),
            },
            None => req,
        };

        self.detect_conflicts(&req);
        self.answer_questions(&req).await;
    }

    /// Records in the message that deny a managed service force it out of
    /// the announced set and into reprobing.
    fn detect_conflicts(&mut self, req: &InboundRequest) {
        let Some(iface) = self.conn.interface(req.iface()) else {
            return;
        };

        let conflicted: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.state == EntryState::Announced)
            .filter(|entry| {
                OwnRecords::of(&entry.service, &iface).denied_by(req.message(), &entry.service)
            })
            .map(|entry| entry.id)
            .collect();

        for id in conflicted {
            debug!(id, "conflicting records received, reprobing");
            let index = self
                .entries
                .iter()
                .position(|e| e.id == id)
                .expect("id collected above");
            let mut entry = self.entries.remove(index);
            entry.state = EntryState::Probing;
            let service = entry.service.clone();
            self.reprobing.insert(id, entry);
            self.spawn_probe(id, service, true);
        }
    }

    async fn answer_questions(&mut self, req: &InboundRequest) {
        let iface = self.conn.interface(req.iface());
        let services = self.announced_services();

        for q in req.message().queries() {
            let mut answers: Vec<DnsRecord> = Vec::new();
            let mut additionals: Vec<DnsRecord> = Vec::new();
            let mut shared = false;

            for service in &services {
                let Some(section) = answer_question(q, service, iface.as_ref()) else {
                    continue;
                };

                answers.extend(records::suppress_known(
                    req.message().answers(),
                    section.answers,
                ));
                additionals.extend(section.additionals);
                shared |= section.shared;
            }

            if answers.is_empty() {
                continue;
            }

            if shared {
                let delay = Duration::from_millis(self.rng.gen_range(SHARED_DELAY_MS));
                tokio::time::sleep(delay).await;
            }

            let legacy = req.is_legacy();
            if legacy {
                records::clamp_legacy_ttl(&mut answers);
                records::clamp_legacy_ttl(&mut additionals);
            }

            let mut msg = records::response_message(req.message().id());
            for rr in answers {
                msg.add_answer(rr);
            }
            for rr in additionals {
                msg.add_additional(rr);
            }

            let out = if legacy || q.mdns_unicast_response() {
                OutResponse {
                    msg,
                    addr: Some(req.from()),
                    iface: Some(req.iface().to_owned()),
                }
            } else {
                OutResponse {
                    msg,
                    addr: None,
                    iface: Some(req.iface().to_owned()),
                }
            };

            if let Err(err) = self.conn.send_response(out).await {
                debug!(%err, "response send failed");
            }
        }
    }

    fn spawn_probe(&mut self, id: u64, service: Service, reprobe: bool) {
        let conn = self.conn.clone();
        let cmd_tx = self.cmd_tx.clone();
        let seed = self.rng.gen::<u64>();

        tokio::spawn(async move {
            let result = if reprobe {
                reprobe_service(&conn, &service).await
            } else {
                let mut rng = StdRng::seed_from_u64(seed);
                probe_service(&conn, &service, &mut rng).await
            };

            let cmd = if reprobe {
                Command::Reprobed(id, result)
            } else {
                Command::Registered(id, result)
            };
            cmd_tx.send(cmd).ok();
        });
    }

    async fn goodbye_all(&mut self) {
        let services = self.announced_services();
        send_goodbyes(&self.conn, &services).await;
    }
}

struct AnswerSection {
    answers: Vec<DnsRecord>,
    additionals: Vec<DnsRecord>,
    shared: bool,
}

/// Builds the answer a single service gives to a single question, or
/// `None` when the question is not about this service.
fn answer_question(
    q: &DnsQuery,
    service: &Service,
    iface: Option<&NetInterface>,
) -> Option<AnswerSection> {
    let name = q.name();

    let addr_records = |service: &Service| -> Vec<DnsRecord> {
        match iface {
            Some(iface) => {
                let mut rrs = records::a(service, iface);
                rrs.extend(records::aaaa(service, iface));
                rrs
            }
            None => Vec::new(),
        }
    };

    if *name == service.service_name() {
        let mut additionals = vec![records::srv(service), records::txt(service)];
        additionals.extend(addr_records(service));
        additionals.push(records::nsec_instance(service));

        Some(AnswerSection {
            answers: vec![records::ptr(service)],
            additionals,
            shared: true,
        })
    } else if *name == service.instance_name() {
        let mut answers = vec![records::srv(service), records::txt(service), records::ptr(service)];
        records::set_cache_flush(&mut answers);

        let mut additionals = addr_records(service);
        additionals.push(records::nsec_instance(service));

        Some(AnswerSection {
            answers,
            additionals,
            shared: false,
        })
    } else if service.try_hostname().as_ref() == Some(name) {
        let mut answers = addr_records(service);
        if answers.is_empty() {
            return None;
        }
        records::set_cache_flush(&mut answers);

        let additionals = match iface {
            Some(iface) => records::nsec_host(service, iface).into_iter().collect(),
            None => Vec::new(),
        };

        Some(AnswerSection {
            answers,
            additionals,
            shared: false,
        })
    } else if *name == service.meta_query_name() {
        Some(AnswerSection {
            answers: vec![records::meta_ptr(service)],
            additionals: Vec::new(),
            shared: false,
        })
    } else {
        None
    }
}

/// Announces the given services on every visible interface, twice, one
/// second apart (RFC 6762 §8.3).
fn spawn_announcements(conn: Arc<Conn>, services: Vec<Service>) {
    for service in services {
        for iface in conn.interfaces() {
            if !service.visible_at(&iface.name) {
                continue;
            }

            let conn = conn.clone();
            let service = service.clone();
            tokio::spawn(async move {
                announce_at_interface(&conn, &service, &iface).await;
            });
        }
    }
}

async fn announce_at_interface(conn: &Conn, service: &Service, iface: &NetInterface) {
    if service.ips_at_interface(iface).is_empty() {
        debug!(
            instance = %service.unescaped_instance_name(),
            iface = %iface.name,
            "no addresses to announce"
        );
        return;
    }

    let mut rrs = records::announcement(service, iface);
    records::set_cache_flush(&mut rrs);

    let mut msg = records::response_message(0);
    for rr in rrs {
        msg.add_answer(rr);
    }

    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }

        if let Err(err) = conn
            .send_response(OutResponse {
                msg: msg.clone(),
                addr: None,
                iface: Some(iface.name.clone()),
            })
            .await
        {
            debug!(%err, iface = %iface.name, "announcement send failed");
        }
    }
}

/// Retracts services by sending their record set with TTL 0, twice per
/// interface, 250 ms apart (RFC 6762 §10.1).
async fn send_goodbyes(conn: &Conn, services: &[Service]) {
    if services.is_empty() {
        return;
    }

    let mut by_iface: BTreeMap<String, Vec<DnsRecord>> = BTreeMap::new();
    for iface in conn.interfaces() {
        for service in services {
            if !service.visible_at(&iface.name) {
                continue;
            }
            if service.ips_at_interface(&iface).is_empty() {
                continue;
            }

            by_iface
                .entry(iface.name.clone())
                .or_default()
                .extend(records::goodbye(service, &iface));
        }
    }

    for (iface, rrs) in by_iface {
        let mut msg = records::response_message(0);
        for rr in rrs {
            msg.add_answer(rr);
        }

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(GOODBYE_INTERVAL).await;
            }

            if let Err(err) = conn
                .send_response(OutResponse {
                    msg: msg.clone(),
                    addr: None,
                    iface: Some(iface.clone()),
                })
                .await
            {
                debug!(%err, %iface, "goodbye send failed");
            }
        }
    }
}

/// Re-announces a changed TXT record twice, one second apart.
fn spawn_txt_announcement(conn: Arc<Conn>, service: Service) {
    tokio::spawn(async move {
        let mut rr = records::txt(&service);
        rr.set_mdns_cache_flush(true);

        let mut msg = records::response_message(0);
        msg.add_answer(rr);

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(ANNOUNCE_INTERVAL).await;
            }

            if let Err(err) = conn
                .send_response(OutResponse {
                    msg: msg.clone(),
                    addr: None,
                    iface: None,
                })
                .await
            {
                debug!(%err, "TXT announcement send failed");
            }
        }
    });
}
