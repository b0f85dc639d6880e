use crate::{
    browse::{browse_loop, BrowseEvent},
    conn::{next_request, pipe, Conn, OutQuery, OutResponse},
    net::NetInterface,
    probe::probe_service,
    records,
    resolve::lookup_instance,
    respond::Responder,
    service::Service,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use trust_dns_client::{
    op::{Message as DnsMessage, Query as DnsQuery},
    rr::{rdata::SRV, DNSClass as DnsClass, Name as DnsName, RData, Record as DnsRecord, RecordType as DnsRecordType},
};

const TEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 123);

fn test_service(name: &str) -> Service {
    Service::builder(name, "_asdf._tcp", 12345)
        .domain("local")
        .host("Computer")
        .txt("key", "value")
        .interface("lo0")
        .interface_ips("lo0", vec![IpAddr::V4(TEST_IP)])
        .build()
        .unwrap()
}

fn spawn_responder(conn: Conn, service: Service) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let mut responder = Responder::over(conn);
    responder.add(service);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        responder.impl_run(Some(shutdown_rx)).await.unwrap();
    });

    (shutdown_tx, task)
}

async fn response_with_id(conn: &Conn, id: u16) -> DnsMessage {
    let mut rx = conn.subscribe();
    loop {
        let req = next_request(&mut rx).await.expect("connection alive");
        if req.message().id() == id {
            return req.message().clone();
        }
    }
}

fn any_question(name: &str) -> DnsQuery {
    let mut query = DnsQuery::new();
    query
        .set_name(DnsName::from_utf8(name).unwrap())
        .set_query_type(DnsRecordType::ANY)
        .set_query_class(DnsClass::IN);
    query
}

#[tokio::test(start_paused = true)]
async fn register_and_resolve_with_explicit_ip() {
    let (responder_conn, resolver_conn) = pipe::pair();
    let (shutdown_tx, task) = spawn_responder(responder_conn, test_service("Test"));

    let instance = DnsName::from_utf8("Test._asdf._tcp.local.").unwrap();
    let resolved = tokio::time::timeout(
        Duration::from_secs(30),
        lookup_instance(&resolver_conn, &instance),
    )
    .await
    .expect("lookup completes")
    .unwrap();

    assert_eq!(resolved.name(), "Test");
    assert_eq!(resolved.service_type(), "_asdf._tcp");
    assert_eq!(resolved.host(), "Computer");
    assert_eq!(resolved.port(), 12345);
    assert_eq!(resolved.txt().get("key").map(String::as_str), Some("value"));
    assert_eq!(
        resolved.ips_at_interface(&NetInterface::named("lo0")),
        vec![IpAddr::V4(TEST_IP)]
    );

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn register_and_resolve_with_spaces_in_name() {
    let (responder_conn, resolver_conn) = pipe::pair();
    let (shutdown_tx, task) = spawn_responder(responder_conn, test_service("Test With Spaces"));

    let instance = crate::service::name_from_labels([
        &b"Test With Spaces"[..],
        b"_asdf",
        b"_tcp",
        b"local",
    ])
    .unwrap();
    let resolved = tokio::time::timeout(
        Duration::from_secs(30),
        lookup_instance(&resolver_conn, &instance),
    )
    .await
    .expect("lookup completes")
    .unwrap();

    assert_eq!(resolved.name(), "Test With Spaces");
    assert_eq!(resolved.service_type(), "_asdf._tcp");
    assert_eq!(resolved.host(), "Computer");

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn instance_query_answers_srv_txt_ptr_with_cache_flush() {
    let (responder_conn, peer_conn) = pipe::pair();
    let service = test_service("Test");
    let (shutdown_tx, task) = spawn_responder(responder_conn, service.clone());

    // Startup probing must finish before the responder answers.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut query = DnsMessage::new();
    query.set_id(42);
    query.add_query(any_question("Test._asdf._tcp.local."));
    peer_conn
        .send_query(OutQuery {
            msg: query,
            iface: None,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), response_with_id(&peer_conn, 42))
        .await
        .expect("response arrives");

    let srvs: Vec<_> = response
        .answers()
        .iter()
        .filter(|rr| rr.rr_type() == DnsRecordType::SRV)
        .collect();
    let txts: Vec<_> = response
        .answers()
        .iter()
        .filter(|rr| rr.rr_type() == DnsRecordType::TXT)
        .collect();

    assert_eq!(srvs.len(), 1);
    assert_eq!(txts.len(), 1);
    assert!(srvs[0].mdns_cache_flush());
    assert!(txts[0].mdns_cache_flush());

    let ptr = response
        .answers()
        .iter()
        .find(|rr| rr.rr_type() == DnsRecordType::PTR)
        .expect("PTR answer");
    assert!(!ptr.mdns_cache_flush());

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn known_answers_leave_only_the_ptr() {
    let (responder_conn, peer_conn) = pipe::pair();
    let service = test_service("Test");
    let (shutdown_tx, task) = spawn_responder(responder_conn, service.clone());

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut query = DnsMessage::new();
    query.set_id(43);
    query.add_query(any_question("Test._asdf._tcp.local."));
    query.add_answer(records::srv(&service));
    query.add_answer(records::txt(&service));
    peer_conn
        .send_query(OutQuery {
            msg: query,
            iface: None,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), response_with_id(&peer_conn, 43))
        .await
        .expect("response arrives");

    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].rr_type(), DnsRecordType::PTR);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn meta_query_enumerates_the_service_type() {
    let (responder_conn, peer_conn) = pipe::pair();
    let (shutdown_tx, task) = spawn_responder(responder_conn, test_service("Test"));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut query = DnsMessage::new();
    query.set_id(44);
    query.add_query(any_question("_services._dns-sd._udp.local."));
    peer_conn
        .send_query(OutQuery {
            msg: query,
            iface: None,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), response_with_id(&peer_conn, 44))
        .await
        .expect("response arrives");

    assert_eq!(response.answers().len(), 1);
    match response.answers()[0].data() {
        Some(RData::PTR(ptr)) => {
            assert_eq!(ptr.to_utf8(), "_asdf._tcp.local.");
        }
        other => panic!("expected PTR, got {other:?}"),
    }

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hostname_conflict_bumps_to_a_numbered_host() {
    let (prober_conn, peer_conn) = pipe::pair();

    // A peer that owns "Alpha.local." with a different address and
    // defends it against every probe.
    tokio::spawn(async move {
        let mut rx = peer_conn.subscribe();
        while let Some(req) = next_request(&mut rx).await {
            let about_alpha = req
                .message()
                .queries()
                .iter()
                .any(|q| q.name().to_utf8().eq_ignore_ascii_case("Alpha.local."));
            if !about_alpha {
                continue;
            }

            let mut msg = records::response_message(0);
            let mut rr = DnsRecord::new();
            rr.set_name(DnsName::from_utf8("Alpha.local.").unwrap())
                .set_rr_type(DnsRecordType::A)
                .set_dns_class(DnsClass::IN)
                .set_ttl(120)
                .set_data(Some(RData::A(Ipv4Addr::new(192, 168, 0, 99))));
            msg.add_answer(rr);

            peer_conn
                .send_response(OutResponse {
                    msg,
                    addr: None,
                    iface: None,
                })
                .await
                .ok();
        }
    });

    let service = Service::builder("Test", "_asdf._tcp", 12345)
        .domain("local")
        .host("Alpha")
        .interface_ips("lo0", vec![IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5))])
        .build()
        .unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let probed = probe_service(&prober_conn, &service, &mut rng)
        .await
        .unwrap();

    assert_eq!(probed.host(), "Alpha-2");
    assert_eq!(probed.name(), "Test");
}

#[tokio::test(start_paused = true)]
async fn losing_the_tie_break_defers_for_a_second() {
    let (prober_conn, peer_conn) = pipe::pair();

    // The peer probes for the same instance name with a lexicographically
    // greater SRV, but only answers once: we lose the tie-break, wait, and
    // claim the name on the next round.
    tokio::spawn(async move {
        let mut rx = peer_conn.subscribe();
        while let Some(req) = next_request(&mut rx).await {
            let about_instance = req
                .message()
                .queries()
                .iter()
                .any(|q| q.name().to_utf8().starts_with("Test."));
            if !about_instance {
                continue;
            }

            let mut msg = records::response_message(0);
            let mut rr = DnsRecord::new();
            rr.set_name(DnsName::from_utf8("Test._asdf._tcp.local.").unwrap())
                .set_rr_type(DnsRecordType::SRV)
                .set_dns_class(DnsClass::IN)
                .set_ttl(120)
                .set_data(Some(RData::SRV(SRV::new(
                    0,
                    0,
                    60000,
                    DnsName::from_utf8("Other.local.").unwrap(),
                ))));
            msg.add_answer(rr);

            peer_conn
                .send_response(OutResponse {
                    msg,
                    addr: None,
                    iface: None,
                })
                .await
                .ok();
            break;
        }
    });

    let service = test_service("Test");
    let started = tokio::time::Instant::now();

    let mut rng = StdRng::seed_from_u64(7);
    let probed = probe_service(&prober_conn, &service, &mut rng)
        .await
        .unwrap();

    // One lost round costs the one-second deferral; the name survives.
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(probed.name(), "Test");
    assert_eq!(probed.host(), "Computer");
}

#[tokio::test(start_paused = true)]
async fn lexicographically_earlier_peers_do_not_deny() {
    let (prober_conn, peer_conn) = pipe::pair();

    tokio::spawn(async move {
        let mut rx = peer_conn.subscribe();
        while let Some(req) = next_request(&mut rx).await {
            let about_instance = req
                .message()
                .queries()
                .iter()
                .any(|q| q.name().to_utf8().starts_with("Test."));
            if !about_instance {
                continue;
            }

            let mut msg = records::response_message(0);
            let mut rr = DnsRecord::new();
            rr.set_name(DnsName::from_utf8("Test._asdf._tcp.local.").unwrap())
                .set_rr_type(DnsRecordType::SRV)
                .set_dns_class(DnsClass::IN)
                .set_ttl(120)
                .set_data(Some(RData::SRV(SRV::new(
                    0,
                    0,
                    1,
                    DnsName::from_utf8("Other.local.").unwrap(),
                ))));
            msg.add_answer(rr);

            peer_conn
                .send_response(OutResponse {
                    msg,
                    addr: None,
                    iface: None,
                })
                .await
                .ok();
            break;
        }
    });

    let service = test_service("Test");
    let mut rng = StdRng::seed_from_u64(7);
    let probed = probe_service(&prober_conn, &service, &mut rng)
        .await
        .unwrap();

    assert_eq!(probed.name(), "Test");
    assert_eq!(probed.host(), "Computer");
}

#[tokio::test(start_paused = true)]
async fn browser_sees_add_and_goodbye() {
    let (responder_conn, browser_conn) = pipe::pair();
    let (shutdown_tx, task) = spawn_responder(responder_conn, test_service("Test"));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let handler: crate::browse::EventHandler = Arc::new(move |event| {
        event_tx.send(event).ok();
    });

    let browse_task = tokio::spawn(async move {
        browse_loop(&browser_conn, "_asdf._tcp", "local", handler)
            .await
            .ok();
    });

    let added = tokio::time::timeout(Duration::from_secs(30), event_rx.recv())
        .await
        .expect("add event")
        .unwrap();
    match added {
        BrowseEvent::Added(entry) => {
            assert_eq!(entry.name, "Test");
            assert_eq!(entry.ty, "_asdf._tcp");
            assert_eq!(entry.iface, "lo0");
            assert_eq!(entry.ips, vec![IpAddr::V4(TEST_IP)]);
        }
        other => panic!("expected Added, got {other:?}"),
    }

    // Shutting the responder down says goodbye; the browser must drop the
    // entry promptly.
    shutdown_tx.send(()).unwrap();

    let removed = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("remove event")
        .unwrap();
    match removed {
        BrowseEvent::Removed(entry) => assert_eq!(entry.name, "Test"),
        other => panic!("expected Removed, got {other:?}"),
    }

    task.await.unwrap();
    browse_task.abort();
}

#[tokio::test(start_paused = true)]
async fn txt_updates_are_reannounced_with_cache_flush() {
    let (responder_conn, peer_conn) = pipe::pair();

    let mut responder = Responder::over(responder_conn);
    let handle = responder.add(test_service("Test"));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        responder.impl_run(Some(shutdown_rx)).await.unwrap();
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut rx = peer_conn.subscribe();
    handle.update_txt([("color".to_owned(), "blue".to_owned())].into());

    let updated = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let req = next_request(&mut rx).await.expect("connection alive");
            let Some(rr) = req.message().answers().first() else {
                continue;
            };

            if rr.rr_type() != DnsRecordType::TXT {
                continue;
            }

            if let Some(RData::TXT(txt)) = rr.data() {
                let strings: Vec<String> = txt
                    .txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data).into_owned())
                    .collect();
                if strings.contains(&"color=blue".to_owned()) {
                    assert!(rr.mdns_cache_flush());
                    return;
                }
            }
        }
    })
    .await;
    updated.expect("TXT update announced");

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn truncated_requests_merge_before_answering() {
    let (responder_conn, peer_conn) = pipe::pair();
    let service = test_service("Test");
    let (shutdown_tx, task) = spawn_responder(responder_conn, service.clone());

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The known answers span two datagrams: SRV in the truncated first
    // part, TXT in the continuation.
    let mut first = DnsMessage::new();
    first.set_id(77);
    first.set_truncated(true);
    first.add_query(any_question("Test._asdf._tcp.local."));
    first.add_answer(records::srv(&service));
    peer_conn
        .send_query(OutQuery {
            msg: first,
            iface: None,
        })
        .await
        .unwrap();

    let mut second = DnsMessage::new();
    second.set_id(77);
    second.add_answer(records::txt(&service));
    peer_conn
        .send_query(OutQuery {
            msg: second,
            iface: None,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), response_with_id(&peer_conn, 77))
        .await
        .expect("response arrives");

    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].rr_type(), DnsRecordType::PTR);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn debug_taps_observe_inbound_requests() {
    let (responder_conn, peer_conn) = pipe::pair();

    let mut responder = Responder::over(responder_conn);
    responder.add(test_service("Test"));

    let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
    responder.debug(move |req| {
        tap_tx.send(req.iface().to_owned()).ok();
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        responder.impl_run(Some(shutdown_rx)).await.unwrap();
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut query = DnsMessage::new();
    query.set_id(99);
    query.add_query(any_question("somewhere-else.local."));
    peer_conn
        .send_query(OutQuery {
            msg: query,
            iface: None,
        })
        .await
        .unwrap();

    let iface = tokio::time::timeout(Duration::from_secs(5), tap_rx.recv())
        .await
        .expect("tap fires")
        .unwrap();
    assert_eq!(iface, "lo0");

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}
