//! Full downloads over the in-memory network: scripted seeders, a real
//! seeding node, and a peer serving corrupt data.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flock_agent::conn::ConnConfig;
use flock_agent::transport::{run_memory_listener, MemoryNetwork};
use flock_agent::{
    EventProducer, Handshaker, PeerAddr, Scheduler, SchedulerConfig, Stage, StoreLayout,
    StoreManager,
};
use flock_core::{Admission, BackoffPolicy, Bitfield, ContentInfo, Event, Message, PeerId};
use tokio::sync::mpsc;

fn blob() -> Vec<u8> {
    (0..40u8).collect()
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        dial_timeout: Duration::from_millis(500),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            retry_limit: 5,
        },
        tick_interval: Duration::from_millis(20),
        drain_timeout: Duration::from_millis(200),
        ..SchedulerConfig::default()
    }
}

fn node(root: &Path, net: &MemoryNetwork, events: EventProducer) -> Scheduler {
    let store = StoreManager::new(
        StoreLayout::under(root),
        1 << 30,
        Duration::from_secs(60),
        events.clone(),
    )
    .unwrap();
    Scheduler::new(
        fast_config(),
        ConnConfig::default(),
        PeerId::generate(),
        Arc::new(store),
        Admission::new(32, 8),
        Arc::new(net.clone()),
        events,
    )
}

fn bitfield(info: &ContentInfo, have: &[u32]) -> Bitfield {
    let mut bf = Bitfield::new(info.num_pieces());
    for &i in have {
        bf.set(i);
    }
    bf
}

/// Serve `have` from `data` to every connection on `addr`. `corrupt` flips
/// every payload byte.
fn scripted_peer(net: &MemoryNetwork, addr: &str, info: ContentInfo, data: Vec<u8>, have: Vec<u32>, corrupt: bool) {
    let mut listener = net.listen(addr);
    let handshaker = Handshaker::new(ConnConfig::default(), PeerId::generate(), EventProducer::noop());
    tokio::spawn(async move {
        while let Some(stream) = listener.accept().await {
            let handshaker = handshaker.clone();
            let info = info.clone();
            let data = data.clone();
            let bf = bitfield(&info, &have);
            tokio::spawn(async move {
                let served = info.clone();
                let lookup = move |hash: &flock_core::ContentHash| {
                    (*hash == served.hash()).then(|| (served.clone(), bf))
                };
                let Ok(mut conn) = handshaker.accept(stream, lookup).await else {
                    return;
                };
                while let Ok(msg) = conn.receive().await {
                    let Message::PieceRequest { index } = msg else {
                        continue;
                    };
                    if !conn.local_bitfield().has(index) {
                        continue;
                    }
                    let Some((start, end)) = info.piece_range(index) else {
                        continue;
                    };
                    let mut payload = data[start as usize..end as usize].to_vec();
                    if corrupt {
                        payload.iter_mut().for_each(|b| *b ^= 0xff);
                    }
                    if conn.send(&Message::PieceData { index, payload }).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn download_assembles_pieces_from_two_partial_peers() {
    let data = blob();
    let info = ContentInfo::from_blob(&data, 16).unwrap();
    assert_eq!(info.num_pieces(), 3);

    let net = MemoryNetwork::new();
    scripted_peer(&net, "peer-a", info.clone(), data.clone(), vec![0, 1], false);
    scripted_peer(&net, "peer-b", info.clone(), data.clone(), vec![2], false);

    let dir = tempfile::tempdir().unwrap();
    let (events, mut rx) = EventProducer::channel();
    let sched = node(dir.path(), &net, events);
    let mut handle = sched
        .download(info.clone(), vec![PeerAddr::from("peer-a"), PeerAddr::from("peer-b")])
        .await
        .unwrap();

    let link = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(link, sched.store().link_path(&info.hash()));
    assert_eq!(std::fs::read(link.join("data")).unwrap(), data);
    assert_eq!(sched.store().stage(&info.hash()), Some(Stage::Cached));

    let events = drain_events(&mut rx);
    let completed = events
        .iter()
        .filter(|e| matches!(e, Event::SwarmCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
    let received: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::PieceReceived { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 3);
}

#[tokio::test]
async fn node_seeds_imported_content_to_another_node() {
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let net = MemoryNetwork::new();

    let seed_dir = tempfile::tempdir().unwrap();
    let seeder = node(seed_dir.path(), &net, EventProducer::noop());
    let info = seeder.store().import(&data, 64).unwrap();
    tokio::spawn(run_memory_listener(net.listen("seeder"), seeder.clone()));

    let dir = tempfile::tempdir().unwrap();
    let downloader = node(dir.path(), &net, EventProducer::noop());
    let mut handle = downloader
        .download(info.clone(), vec!["seeder".into()])
        .await
        .unwrap();
    let link = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(std::fs::read(link.join("data")).unwrap(), data);

    // Both sides complete: connections close and both swarms go away.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !downloader.swarms().is_empty() || !seeder.swarms().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("swarms did not close");

    // A second request is served from the cache.
    let mut again = downloader.download(info.clone(), vec![]).await.unwrap();
    assert_eq!(again.wait().await.unwrap(), link);
}

#[tokio::test]
async fn corrupt_pieces_are_never_written() {
    let data = blob();
    let info = ContentInfo::from_blob(&data, 16).unwrap();

    let net = MemoryNetwork::new();
    scripted_peer(&net, "liar", info.clone(), data.clone(), vec![0, 1, 2], true);
    scripted_peer(&net, "honest", info.clone(), data.clone(), vec![0, 1, 2], false);

    let dir = tempfile::tempdir().unwrap();
    let sched = node(dir.path(), &net, EventProducer::noop());
    let mut handle = sched
        .download(info.clone(), vec!["liar".into(), "honest".into()])
        .await
        .unwrap();
    let link = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(std::fs::read(link.join("data")).unwrap(), data);
}

#[tokio::test]
async fn accepting_node_rejects_unknown_content() {
    let net = MemoryNetwork::new();
    let seed_dir = tempfile::tempdir().unwrap();
    let seeder = node(seed_dir.path(), &net, EventProducer::noop());
    tokio::spawn(run_memory_listener(net.listen("seeder"), seeder.clone()));

    let data = blob();
    let info = ContentInfo::from_blob(&data, 16).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let downloader = node(dir.path(), &net, EventProducer::noop());
    let mut handle = downloader
        .download(info, vec!["seeder".into()])
        .await
        .unwrap();
    let res = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("download timed out");
    assert!(matches!(
        res,
        Err(flock_agent::SchedulerError::PeersExhausted { given_up: 1, .. })
    ));
    assert!(seeder.swarms().is_empty());
}
