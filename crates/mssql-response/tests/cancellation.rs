//! Token processor tests: aggregation, token priority over cancellation,
//! and the attention confirmation drain across one or two responses.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mssql_response::{
    Error, FramedSource, Outputs, PacketSink, Session, SqlValue, Token, TokenProcessor,
};
use tds_tokens::{DoneStatus, PACKET_HEADER_SIZE, PacketType};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use common::*;

type Proc = TokenProcessor<FramedSource<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

fn start(
    session: Arc<Session>,
    cancel: CancellationToken,
) -> (Proc, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(client);
    let source = Arc::new(Mutex::new(FramedSource::new(read_half)));
    let sink = PacketSink::new(write_half);
    let processor =
        TokenProcessor::start_reading(source, sink, session, cancel, Outputs::none());
    (processor, server)
}

#[tokio::test]
async fn iterate_aggregates_rows_and_counts() {
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(Arc::clone(&session), CancellationToken::new());

    let mut payload = int4_colmetadata(&["id"]);
    payload.extend_from_slice(&int4_row(&[1]));
    payload.extend_from_slice(&int4_row(&[2]));
    payload.extend_from_slice(&done(DoneStatus::COUNT, 2));
    server.write_all(&reply_message(&payload)).await.unwrap();

    processor.iterate_response().await.expect("clean response");
    assert_eq!(processor.last_row(), Some(&[SqlValue::Int(2)][..]));
    assert_eq!(processor.row_count(), 2);
    assert_eq!(session.columns().unwrap().len(), 1);
}

#[tokio::test]
async fn iterate_returns_first_error() {
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(session, CancellationToken::new());

    let mut payload = error_token(208, 16, "Invalid object name 'x'.");
    payload.extend_from_slice(&done(DoneStatus::ERROR, 0));
    server.write_all(&reply_message(&payload)).await.unwrap();

    let err = processor.iterate_response().await.expect_err("sql error");
    match err {
        Error::Server(e) => assert_eq!(e.number, 208),
        other => panic!("expected server error, got {other}"),
    }
}

#[tokio::test]
async fn return_status_reaches_session() {
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(Arc::clone(&session), CancellationToken::new());

    let mut payload = vec![0x79]; // RETURNSTATUS
    payload.extend_from_slice(&3i32.to_le_bytes());
    payload.extend_from_slice(&done(DoneStatus::FINAL, 0));
    server.write_all(&reply_message(&payload)).await.unwrap();

    processor.iterate_response().await.unwrap();
    assert_eq!(session.return_status(), Some(3));
}

#[tokio::test]
async fn enqueued_token_beats_simultaneous_cancellation() {
    let cancel = CancellationToken::new();
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(session, cancel.clone());

    let mut payload = int4_colmetadata(&["id"]);
    payload.extend_from_slice(&int4_row(&[42]));
    payload.extend_from_slice(&done(DoneStatus::FINAL, 0));
    server.write_all(&reply_message(&payload)).await.unwrap();

    // Give the reader time to enqueue, then cancel before pulling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let token = processor.next_token().await.expect("token, not cancellation");
    assert!(matches!(token, Some(Token::Columns(_))));
}

async fn read_attention(server: &mut DuplexStream) {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    server.read_exact(&mut header).await.expect("attention header");
    assert_eq!(header[0], PacketType::Attention as u8);
}

#[tokio::test]
async fn cancellation_confirmed_in_current_response() {
    // Scenario S6: columns and a row arrive, the response stays open, the
    // caller cancels; the server finishes the response with DONE+ATTN.
    let cancel = CancellationToken::new();
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(session, cancel.clone());

    let mut payload = int4_colmetadata(&["id"]);
    payload.extend_from_slice(&int4_row(&[42]));
    // Not end-of-message: the reader stays blocked awaiting more packets.
    server
        .write_all(&packet(PacketType::TabularResult, false, &payload))
        .await
        .unwrap();

    let server_task = tokio::spawn(async move {
        read_attention(&mut server).await;
        let confirmation = done(DoneStatus::ATTN, 0);
        server
            .write_all(&packet(PacketType::TabularResult, true, &confirmation))
            .await
            .unwrap();
        server
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });

    let err = processor.iterate_response().await.expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    // The row observed before cancellation is retained.
    assert_eq!(processor.last_row(), Some(&[SqlValue::Int(42)][..]));

    server_task.await.unwrap();
}

#[tokio::test]
async fn cancellation_confirmed_in_next_response() {
    // The current response completes without ATTN just as the caller
    // cancels; the confirmation arrives in the following response.
    let cancel = CancellationToken::new();
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(session, cancel.clone());

    server
        .write_all(&packet(PacketType::TabularResult, false, &int4_colmetadata(&["id"])))
        .await
        .unwrap();

    let server_task = tokio::spawn(async move {
        read_attention(&mut server).await;
        // Finish the current response with a plain DONE...
        server
            .write_all(&packet(
                PacketType::TabularResult,
                true,
                &done(DoneStatus::FINAL, 0),
            ))
            .await
            .unwrap();
        // ...and confirm in the next one.
        server
            .write_all(&packet(
                PacketType::TabularResult,
                true,
                &done(DoneStatus::ATTN, 0),
            ))
            .await
            .unwrap();
        server
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });

    let err = processor.iterate_response().await.expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    server_task.await.unwrap();
}

#[tokio::test]
async fn missing_confirmation_is_fatal() {
    let cancel = CancellationToken::new();
    let session = Arc::new(Session::new());
    let (mut processor, mut server) = start(session, cancel.clone());

    server
        .write_all(&packet(PacketType::TabularResult, false, &int4_colmetadata(&["id"])))
        .await
        .unwrap();

    let server_task = tokio::spawn(async move {
        read_attention(&mut server).await;
        // Two full responses, neither acknowledging the attention.
        for _ in 0..2 {
            server
                .write_all(&packet(
                    PacketType::TabularResult,
                    true,
                    &done(DoneStatus::FINAL, 0),
                ))
                .await
                .unwrap();
        }
        server
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });

    let err = processor.iterate_response().await.expect_err("fatal");
    assert!(matches!(err, Error::NoCancelConfirmation));
    assert!(err.is_fatal());
    server_task.await.unwrap();
}
