mod common;

use beam_core::AppEvent;
use beam_core::history::TransferState;
use beam_core::transfer::Direction;
use beam_core::transfer::hash::compute_file_hash;
use common::{Node, pattern};

const TEN_MB: usize = 10 * 1024 * 1024;

#[tokio::test]
async fn test_ten_megabyte_round_trip() {
    let mut receiver = Node::start().await;
    let mut sender = Node::start().await;

    let source = sender.write_source("big.bin", &pattern(TEN_MB)).await;
    let ids = sender.session.send_files_to(receiver.addr, vec![source.clone()]);
    assert_eq!(ids.len(), 1);

    let request = receiver
        .wait_for(|e| match e {
            AppEvent::TransferRequest(request) => Some(request),
            _ => None,
        })
        .await;
    assert_eq!(request.file_name, "big.bin");
    assert_eq!(request.declared_size, TEN_MB as u64);
    receiver
        .session
        .accept_request(&request.request_id)
        .await
        .expect("request should still be pending");

    let (saved_path, truncated) = receiver
        .wait_for(|e| match e {
            AppEvent::TransferCompleted {
                saved_path,
                truncated,
                direction: Direction::Incoming,
                ..
            } => Some((saved_path, truncated)),
            AppEvent::TransferFailed { error, .. } => panic!("receive failed: {}", error),
            _ => None,
        })
        .await;
    let saved_path = saved_path.expect("incoming completion has a path");
    assert!(!truncated);
    assert_eq!(saved_path, receiver.download_dir().join("big.bin"));

    let received_len = tokio::fs::metadata(&saved_path).await.unwrap().len();
    assert_eq!(received_len, TEN_MB as u64);
    assert_eq!(
        compute_file_hash(&saved_path).await.unwrap(),
        compute_file_hash(&source).await.unwrap()
    );

    let sent_id = sender
        .wait_for(|e| match e {
            AppEvent::TransferCompleted {
                id,
                direction: Direction::Outgoing,
                ..
            } => Some(id),
            AppEvent::TransferFailed { error, .. } => panic!("send failed: {}", error),
            _ => None,
        })
        .await;
    assert_eq!(sent_id, ids[0]);

    let history = sender.session.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, TransferState::Completed);
    assert_eq!(history[0].direction, Direction::Outgoing);

    let history = receiver.session.history();
    assert_eq!(history[0].state, TransferState::Completed);
    assert_eq!(history[0].progress_percent, 100.0);
}

#[tokio::test]
async fn test_duplicate_names_get_suffix() {
    let mut receiver = Node::start().await;
    let sender = Node::start().await;

    let first = sender.write_source("one/a.txt", b"first").await;
    let second = sender.write_source("two/a.txt", b"second").await;
    sender
        .session
        .send_files_to(receiver.addr, vec![first, second]);

    let mut saved = Vec::new();
    while saved.len() < 2 {
        let event = receiver
            .wait_for(|e| match e {
                AppEvent::TransferRequest(_) | AppEvent::TransferCompleted { .. } => Some(e),
                _ => None,
            })
            .await;
        match event {
            AppEvent::TransferRequest(request) => {
                receiver
                    .session
                    .accept_request(&request.request_id)
                    .await
                    .unwrap();
            }
            AppEvent::TransferCompleted { saved_path, .. } => saved.push(saved_path.unwrap()),
            _ => unreachable!(),
        }
    }

    let dir = receiver.download_dir();
    assert_eq!(saved, vec![dir.join("a.txt"), dir.join("a_1.txt")]);
    assert_eq!(tokio::fs::read(dir.join("a.txt")).await.unwrap(), b"first");
    assert_eq!(tokio::fs::read(dir.join("a_1.txt")).await.unwrap(), b"second");
}
