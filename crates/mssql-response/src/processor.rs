//! Consumer-side token iteration with cancellation.
//!
//! The processor pulls tokens off the reader's channel and aggregates
//! per-response effects. Cancellation is cooperative and in-band: on a
//! cancelled context the processor sends a TDS attention packet on the
//! writer half, then drains up to two responses looking for a DONE with
//! the ATTN bit. A produced-but-undelivered token always wins over a
//! simultaneous cancellation: the channel is polled non-blockingly before
//! the cancellation signal is consulted.

use std::sync::Arc;

use tds_tokens::{ResponseSource, SqlValue, Token};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::framed::PacketSink;
use crate::outputs::Outputs;
use crate::reader::{TOKEN_CHANNEL_CAPACITY, read_response};
use crate::session::Session;

type TokenItem = Result<Token, Error>;

/// Pull iterator over one (or, after cancellation, two) server responses.
pub struct TokenProcessor<S, W> {
    rx: mpsc::Receiver<TokenItem>,
    cancel: CancellationToken,
    source: Arc<Mutex<S>>,
    sink: PacketSink<W>,
    session: Arc<Session>,
    outputs: Outputs,
    last_row: Option<Vec<SqlValue>>,
    row_count: u64,
    first_error: Option<Error>,
}

impl<S, W> TokenProcessor<S, W>
where
    S: ResponseSource + 'static,
    W: AsyncWrite + Unpin + Send,
{
    /// Spawn a reader task for the next response and return a processor
    /// over its token channel.
    pub fn start_reading(
        source: Arc<Mutex<S>>,
        sink: PacketSink<W>,
        session: Arc<Session>,
        cancel: CancellationToken,
        outputs: Outputs,
    ) -> Self {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(read_response(
            Arc::clone(&source),
            Arc::clone(&session),
            outputs.clone(),
            tx,
        ));
        Self {
            rx,
            cancel,
            source,
            sink,
            session,
            outputs,
            last_row: None,
            row_count: 0,
            first_error: None,
        }
    }

    /// Next token, or `None` at end of response.
    ///
    /// Reader-published errors surface as `Err`. On a cancelled context
    /// this drives the attention handshake and returns
    /// [`Error::Cancelled`] once the server confirms, or
    /// [`Error::NoCancelConfirmation`] if two drained responses carry no
    /// confirmation.
    pub async fn next_token(&mut self) -> Result<Option<Token>, Error> {
        // Non-blocking check first: a token already produced is delivered
        // even if the context was cancelled at the same moment.
        match self.rx.try_recv() {
            Ok(Ok(token)) => return Ok(Some(token)),
            Ok(Err(err)) => return Err(err),
            Err(TryRecvError::Disconnected) => return Ok(None),
            Err(TryRecvError::Empty) => {}
        }

        tokio::select! {
            biased;
            item = self.rx.recv() => match item {
                Some(Ok(token)) => Ok(Some(token)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            },
            () = self.cancel.cancelled() => self.handle_cancellation().await,
        }
    }

    async fn handle_cancellation(&mut self) -> Result<Option<Token>, Error> {
        // If attention cannot be sent the connection is beyond recovery.
        self.sink.send_attention().await.map_err(Error::Protocol)?;

        // The confirmation may be in the current response, or, if the
        // response completed just before the attention went out, in the
        // next one. Never further.
        if drain_for_attention(&mut self.rx).await {
            return Err(Error::Cancelled);
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(read_response(
            Arc::clone(&self.source),
            Arc::clone(&self.session),
            self.outputs.clone(),
            tx,
        ));
        self.rx = rx;
        if drain_for_attention(&mut self.rx).await {
            return Err(Error::Cancelled);
        }

        Err(Error::NoCancelConfirmation)
    }

    /// Iterate the whole response, aggregating effects, and return the
    /// first SQL error the response reported (if any).
    pub async fn iterate_response(&mut self) -> Result<(), Error> {
        loop {
            let Some(token) = self.next_token().await? else {
                return match self.first_error.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            };
            match token {
                Token::Columns(columns) => self.session.set_columns(columns),
                Token::Row(row) => self.last_row = Some(row),
                Token::DoneInProc(done) => {
                    if done.status.count() {
                        self.row_count += done.row_count;
                    }
                }
                Token::Done(done) => {
                    if done.status.count() {
                        self.row_count += done.row_count;
                    }
                    if done.is_error() && self.first_error.is_none() {
                        self.first_error = Some(Error::Server(done.sql_error()));
                    }
                }
                Token::ReturnStatus(status) => self.session.set_return_status(status),
                _ => {}
            }
        }
    }

    /// The most recent row seen while iterating.
    #[must_use]
    pub fn last_row(&self) -> Option<&[SqlValue]> {
        self.last_row.as_deref()
    }

    /// Cumulative affected-row count from DONE tokens with the COUNT bit.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}

/// Drain a token channel until it closes, watching for a DONE that
/// acknowledges the attention request.
async fn drain_for_attention(rx: &mut mpsc::Receiver<TokenItem>) -> bool {
    let mut confirmed = false;
    while let Some(item) = rx.recv().await {
        if let Ok(Token::Done(done)) = item {
            if done.status.attn() {
                confirmed = true;
            }
        }
    }
    confirmed
}
