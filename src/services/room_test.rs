use super::*;
use crate::frame::{AWARENESS_UPDATE, DOC_UPDATE};

fn member(capacity: usize) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(capacity)
}

#[tokio::test]
async fn publish_reaches_others_but_not_sender() {
    let rooms = Rooms::new();
    let board = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (a_tx, mut a_rx) = member(8);
    let (b_tx, mut b_rx) = member(8);
    rooms.join(board, a, a_tx).await;
    rooms.join(board, b, b_tx).await;

    let frame = Frame::request(DOC_UPDATE, Data::new()).with_from("peer-a");
    rooms.publish(board, a, &frame).await;

    assert_eq!(b_rx.try_recv().unwrap().id, frame.id);
    assert!(a_rx.try_recv().is_err());
}

#[tokio::test]
async fn rooms_are_isolated_per_whiteboard() {
    let rooms = Rooms::new();
    let (one, two) = (Uuid::new_v4(), Uuid::new_v4());
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (a_tx, _a_rx) = member(8);
    let (b_tx, mut b_rx) = member(8);
    rooms.join(one, a, a_tx).await;
    rooms.join(two, b, b_tx).await;

    rooms.publish(one, a, &Frame::request(DOC_UPDATE, Data::new())).await;
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test]
async fn part_announces_remembered_peer_id() {
    let rooms = Rooms::new();
    let board = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (a_tx, _a_rx) = member(8);
    let (b_tx, mut b_rx) = member(8);
    rooms.join(board, a, a_tx).await;
    rooms.join(board, b, b_tx).await;

    rooms
        .publish(board, a, &Frame::request(DOC_UPDATE, Data::new()).with_from("peer-a"))
        .await;
    b_rx.try_recv().unwrap();

    rooms.part(board, a).await;
    let part = b_rx.try_recv().unwrap();
    assert_eq!(part.syscall, PEER_PART);
    assert_eq!(part.data["peer_id"], "peer-a");
    assert_eq!(part.whiteboard_id, Some(board));
    assert_eq!(rooms.client_count(board).await, 1);
}

#[tokio::test]
async fn part_of_anonymous_connection_is_silent() {
    let rooms = Rooms::new();
    let board = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (a_tx, _a_rx) = member(8);
    let (b_tx, mut b_rx) = member(8);
    rooms.join(board, a, a_tx).await;
    rooms.join(board, b, b_tx).await;

    rooms.part(board, a).await;
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test]
async fn last_part_evicts_room() {
    let rooms = Rooms::new();
    let board = Uuid::new_v4();
    let a = Uuid::new_v4();
    let (a_tx, _a_rx) = member(8);
    rooms.join(board, a, a_tx).await;
    rooms.part(board, a).await;
    rooms.part(board, a).await;
    assert_eq!(rooms.client_count(board).await, 0);
    assert!(rooms.inner.read().await.is_empty());
}

#[tokio::test]
async fn full_client_is_evicted_without_blocking() {
    let rooms = Rooms::new();
    let board = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (a_tx, _a_rx) = member(8);
    let (b_tx, mut b_rx) = member(1);
    rooms.join(board, a, a_tx).await;
    rooms.join(board, b, b_tx).await;

    for _ in 0..3 {
        rooms.publish(board, a, &Frame::request(DOC_UPDATE, Data::new())).await;
    }
    assert!(b_rx.recv().await.is_some());
    assert!(b_rx.recv().await.is_none());
    assert_eq!(rooms.client_count(board).await, 1);
}

#[tokio::test]
async fn awareness_burst_evicts_member_before_doc_update_is_lost() {
    let rooms = Rooms::new();
    let board = Uuid::new_v4();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let (a_tx, _a_rx) = member(CLIENT_CHANNEL_CAPACITY);
    let (b_tx, mut b_rx) = member(CLIENT_CHANNEL_CAPACITY);
    let (c_tx, mut c_rx) = member(CLIENT_CHANNEL_CAPACITY * 2);
    rooms.join(board, a, a_tx).await;
    rooms.join(board, b, b_tx).await;
    rooms.join(board, c, c_tx).await;

    rooms
        .publish(board, b, &Frame::request(AWARENESS_UPDATE, Data::new()).with_from("peer-b"))
        .await;
    for _ in 0..CLIENT_CHANNEL_CAPACITY {
        rooms.publish(board, a, &Frame::request(AWARENESS_UPDATE, Data::new())).await;
    }
    rooms.publish(board, a, &Frame::request(DOC_UPDATE, Data::new())).await;

    // b's buffer held every awareness frame, so the doc update evicted it
    let mut delivered = 0;
    while b_rx.recv().await.is_some() {
        delivered += 1;
    }
    assert_eq!(delivered, CLIENT_CHANNEL_CAPACITY);
    assert_eq!(rooms.client_count(board).await, 2);

    let mut last = None;
    while let Ok(frame) = c_rx.try_recv() {
        last = Some(frame);
    }
    let part = last.unwrap();
    assert_eq!(part.syscall, PEER_PART);
    assert_eq!(part.data["peer_id"], "peer-b");
}
