mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fifocast::broadcast::FifoBroadcastApp;
use fifocast::event_log::EventLog;
use fifocast::link::Packet;
use tokio::net::UdpSocket;
use tokio::time::sleep;

#[tokio::test]
async fn test_three_processes_deliver_everything() {
    let hosts = Arc::new(common::localhost_hosts(23000, 3));
    let dir = tempfile::tempdir().unwrap();
    const M: u32 = 5;

    let mut apps = Vec::new();
    let mut logs = Vec::new();
    for id in 1..=3 {
        let path = dir.path().join(format!("{}.out", id));
        let log = Arc::new(EventLog::new(&path));
        let mut app = FifoBroadcastApp::new(id, hosts.clone(), M, log.clone())
            .await
            .unwrap();
        app.start();
        apps.push(app);
        logs.push((log, path));
    }

    for (log, path) in &logs {
        let lines = common::await_log_lines(log, path, |lines| {
            // 5 broadcasts and 15 deliveries per process
            lines.len() >= 20
        })
        .await;

        for seq in 1..=M {
            assert_eq!(lines.iter().filter(|l| **l == format!("b {}", seq)).count(), 1);
            for origin in 1..=3 {
                assert_eq!(
                    lines.iter().filter(|l| **l == format!("d {} {}", origin, seq)).count(),
                    1,
                    "expected exactly one delivery of {} {} in {:?}",
                    origin, seq, path,
                );
            }
        }
        assert_eq!(lines.len(), 20);
        common::assert_fifo_order(&lines);
    }

    for mut app in apps {
        app.shut_down().await;
    }
}

#[tokio::test]
async fn test_majority_survives_a_silent_process() {
    // three processes configured, process 3 never comes up. The remaining
    // two are a majority and must deliver each other's messages anyway.
    let hosts = Arc::new(common::localhost_hosts(23020, 3));
    let dir = tempfile::tempdir().unwrap();
    const M: u32 = 3;

    let mut apps = Vec::new();
    let mut logs = Vec::new();
    for id in 1..=2 {
        let path = dir.path().join(format!("{}.out", id));
        let log = Arc::new(EventLog::new(&path));
        let mut app = FifoBroadcastApp::new(id, hosts.clone(), M, log.clone())
            .await
            .unwrap();
        app.start();
        apps.push(app);
        logs.push((log, path));
    }

    for (log, path) in &logs {
        let lines = common::await_log_lines(log, path, |lines| {
            (1..=M).all(|seq| {
                [1, 2].iter().all(|origin| {
                    lines.iter().any(|l| l == &format!("d {} {}", origin, seq))
                })
            })
        })
        .await;

        assert!(
            !lines.iter().any(|l| l.starts_with("d 3 ")),
            "nothing from the silent process can ever be delivered",
        );
        common::assert_fifo_order(&lines);
    }

    for mut app in apps {
        app.shut_down().await;
    }
}

#[tokio::test]
async fn test_wire_reordering_is_straightened_per_origin() {
    let hosts = Arc::new(common::localhost_hosts(23060, 2));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2.out");
    let log = Arc::new(EventLog::new(&path));

    let mut app = FifoBroadcastApp::new(2, hosts.clone(), 0, log.clone()).await.unwrap();
    app.start();

    // pose as process 1 by binding its send port, and deliver seq 2 behind
    // seq 3 on the wire. With two processes, origin + self are already a
    // majority, so every receipt URB-delivers immediately and only the
    // resequencer stands between the wire order and the log
    let origin_socket = UdpSocket::bind(hosts.get(1).unwrap().send_addr())
        .await
        .unwrap();
    let to = hosts.get(2).unwrap().addr;
    for seqs in [vec![1u32], vec![3], vec![2]] {
        let mut buf = BytesMut::new();
        Packet::Data { origin: 1, seqs }.ser(&mut buf);
        origin_socket.send_to(&buf, to).await.unwrap();
        sleep(Duration::from_millis(30)).await;
    }

    let lines = common::await_log_lines(&log, &path, |lines| lines.len() >= 3).await;
    app.shut_down().await;

    assert_eq!(lines, vec!["d 1 1", "d 1 2", "d 1 3"]);
}

#[tokio::test]
async fn test_single_process_is_its_own_majority() {
    let hosts = Arc::new(common::localhost_hosts(23040, 1));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("1.out");
    let log = Arc::new(EventLog::new(&path));

    let mut app = FifoBroadcastApp::new(1, hosts.clone(), 3, log.clone()).await.unwrap();
    app.start();

    let lines = common::await_log_lines(&log, &path, |lines| lines.len() >= 6).await;
    app.shut_down().await;

    assert_eq!(
        lines,
        vec!["b 1", "d 1 1", "b 2", "d 1 2", "b 3", "d 1 3"],
    );
}
