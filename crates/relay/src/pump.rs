// Bidirectional frame pump between the client leg and the upstream leg.
//
// Two forwarding loops run concurrently inside the session task. The first
// one to stop cancels a shared token; the other notices at its receive
// suspension point. Sends are never raced against the token, so a frame
// that started going out always finishes or fails on its own. A send that
// makes no progress for a full heartbeat deadline fails the leg it targets.

use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::ws::{Message as ClientMessage, Utf8Bytes as ClientText},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    Sink, SinkExt, Stream, StreamExt,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Message as UpstreamMessage, Utf8Bytes as UpstreamText};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One unit of relayed data. Never inspected.
///
/// Text payloads stay in their received buffer; they are UTF-8 because the
/// receiving socket validated them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    ClientClosed,
    UpstreamClosed,
    ClientError,
    UpstreamError,
    /// The server is shutting down; neither leg ended on its own.
    Shutdown,
}

impl TerminationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::UpstreamClosed => "upstream_closed",
            Self::ClientError => "client_error",
            Self::UpstreamError => "upstream_error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// What a forwarding loop makes of one inbound message.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// Ping, pong and raw frames. Proof of life, nothing to forward.
    Control,
    Close,
}

/// Message types the pump can read from and write to.
pub trait WireMessage: Sized {
    fn classify(self) -> Inbound;
    fn from_frame(frame: Frame) -> Self;
    fn ping() -> Self;
}

impl WireMessage for ClientMessage {
    fn classify(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Frame(Frame::Text(text.into())),
            Self::Binary(data) => Inbound::Frame(Frame::Binary(data)),
            Self::Ping(_) | Self::Pong(_) => Inbound::Control,
            Self::Close(_) => Inbound::Close,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => match ClientText::try_from(text.clone()) {
                Ok(text) => Self::Text(text),
                Err(_) => Self::Binary(text),
            },
            Frame::Binary(data) => Self::Binary(data),
        }
    }

    fn ping() -> Self {
        Self::Ping(Bytes::new())
    }
}

impl WireMessage for UpstreamMessage {
    fn classify(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Frame(Frame::Text(text.into())),
            Self::Binary(data) => Inbound::Frame(Frame::Binary(data)),
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Inbound::Control,
            Self::Close(_) => Inbound::Close,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => match UpstreamText::try_from(text.clone()) {
                Ok(text) => Self::Text(text),
                Err(_) => Self::Binary(text),
            },
            Frame::Binary(data) => Self::Binary(data),
        }
    }

    fn ping() -> Self {
        Self::Ping(Bytes::new())
    }
}

/// Protocol-level keepalive applied to both legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    /// Extra grace after a missed interval before the peer is declared dead.
    pub pong_timeout: Duration,
}

impl Heartbeat {
    fn deadline(self) -> Duration {
        self.interval + self.pong_timeout
    }
}

/// Read and write halves of one leg.
pub struct Link<R, W> {
    pub(crate) rx: R,
    pub(crate) tx: W,
}

impl<R, W> Link<R, W> {
    pub fn new(rx: R, tx: W) -> Self {
        Self { rx, tx }
    }
}

impl<S, M> Link<SplitStream<S>, SplitSink<S, M>>
where
    S: Stream + Sink<M>,
{
    pub fn split(socket: S) -> Self {
        let (tx, rx) = socket.split();
        Self::new(rx, tx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Client,
    Upstream,
}

impl Leg {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        }
    }

    const fn closed(self) -> TerminationReason {
        match self {
            Self::Client => TerminationReason::ClientClosed,
            Self::Upstream => TerminationReason::UpstreamClosed,
        }
    }

    const fn failed(self) -> TerminationReason {
        match self {
            Self::Client => TerminationReason::ClientError,
            Self::Upstream => TerminationReason::UpstreamError,
        }
    }
}

/// Last time anything arrived on a leg, as an offset from session start.
struct Liveness {
    origin: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn new(origin: Instant) -> Self {
        Self { origin, last_seen_ms: AtomicU64::new(0) }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last_seen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub reason: TerminationReason,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

struct LoopOutcome {
    /// `None` when the loop was cancelled, or ended only after the other
    /// loop had already stopped the relay.
    exit: Option<TerminationReason>,
    forwarded: u64,
}

enum Step<T> {
    Inbound(Option<T>),
    Heartbeat,
}

/// Relays frames both ways until either leg stops or `shutdown` fires.
///
/// Neither link is closed here; the caller owns teardown.
pub async fn run<CR, CW, CM, CE, UR, UW, UM, UE>(
    client: &mut Link<CR, CW>,
    upstream: &mut Link<UR, UW>,
    heartbeat: Heartbeat,
    shutdown: &CancellationToken,
) -> PumpReport
where
    CR: Stream<Item = Result<CM, CE>> + Unpin,
    CW: Sink<CM> + Unpin,
    CW::Error: Display,
    CM: WireMessage,
    CE: Display,
    UR: Stream<Item = Result<UM, UE>> + Unpin,
    UW: Sink<UM> + Unpin,
    UW::Error: Display,
    UM: WireMessage,
    UE: Display,
{
    let cancel = shutdown.child_token();
    let origin = Instant::now();
    let client_seen = Liveness::new(origin);
    let upstream_seen = Liveness::new(origin);

    let Link { rx: client_rx, tx: client_tx } = client;
    let Link { rx: upstream_rx, tx: upstream_tx } = upstream;

    let client_to_upstream = async {
        let outcome = forward::<_, _, _, UM, _>(
            Leg::Client,
            Leg::Upstream,
            client_rx,
            upstream_tx,
            &client_seen,
            &upstream_seen,
            heartbeat,
            &cancel,
        )
        .await;
        settle(outcome, &cancel)
    };
    let upstream_to_client = async {
        let outcome = forward::<_, _, _, CM, _>(
            Leg::Upstream,
            Leg::Client,
            upstream_rx,
            client_tx,
            &upstream_seen,
            &client_seen,
            heartbeat,
            &cancel,
        )
        .await;
        settle(outcome, &cancel)
    };

    let (up, down) = tokio::join!(client_to_upstream, upstream_to_client);

    PumpReport {
        reason: up.exit.or(down.exit).unwrap_or(TerminationReason::Shutdown),
        client_to_upstream: up.forwarded,
        upstream_to_client: down.forwarded,
    }
}

/// Only the loop that stops first names the reason. A loop that ends after
/// the token fired is reporting fallout from the other leg's teardown.
fn settle(mut outcome: LoopOutcome, cancel: &CancellationToken) -> LoopOutcome {
    if cancel.is_cancelled() {
        outcome.exit = None;
    }
    cancel.cancel();
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn forward<R, W, In, Out, E>(
    from: Leg,
    to: Leg,
    rx: &mut R,
    tx: &mut W,
    from_seen: &Liveness,
    to_seen: &Liveness,
    heartbeat: Heartbeat,
    cancel: &CancellationToken,
) -> LoopOutcome
where
    R: Stream<Item = Result<In, E>> + Unpin,
    In: WireMessage,
    E: Display,
    W: Sink<Out> + Unpin,
    W::Error: Display,
    Out: WireMessage,
{
    let mut forwarded = 0;
    let mut ticker =
        tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            _ = ticker.tick() => Step::Heartbeat,
            next = rx.next() => Step::Inbound(next),
        };

        match step {
            Step::Inbound(None) => break Some(from.closed()),
            Step::Inbound(Some(Err(error))) => {
                debug!(leg = from.as_str(), error = %error, "receive failed");
                break Some(from.failed());
            }
            Step::Inbound(Some(Ok(message))) => {
                from_seen.touch();
                match message.classify() {
                    Inbound::Frame(frame) => {
                        let message = Out::from_frame(frame);
                        if let Err(reason) = deliver(to, tx, message, heartbeat).await {
                            break Some(reason);
                        }
                        forwarded += 1;
                    }
                    Inbound::Control => {}
                    Inbound::Close => break Some(from.closed()),
                }
            }
            Step::Heartbeat => {
                let idle = to_seen.idle();
                if idle > heartbeat.deadline() {
                    warn!(
                        leg = to.as_str(),
                        idle_ms = idle.as_millis() as u64,
                        "heartbeat timeout, peer presumed dead"
                    );
                    break Some(to.failed());
                }
                if let Err(reason) = deliver(to, tx, Out::ping(), heartbeat).await {
                    break Some(reason);
                }
            }
        }
    };

    LoopOutcome { exit, forwarded }
}

/// Sends one message to `to`. A send error closes the leg; a send stuck
/// past the heartbeat deadline means the peer stopped reading.
async fn deliver<W, Out>(
    to: Leg,
    tx: &mut W,
    message: Out,
    heartbeat: Heartbeat,
) -> Result<(), TerminationReason>
where
    W: Sink<Out> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(heartbeat.deadline(), tx.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => {
            debug!(leg = to.as_str(), error = %error, "send failed");
            Err(to.closed())
        }
        Err(_) => {
            warn!(
                leg = to.as_str(),
                stalled_ms = heartbeat.deadline().as_millis() as u64,
                "send stalled, peer presumed dead"
            );
            Err(to.failed())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        io,
        pin::Pin,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use axum::{
        body::Bytes,
        extract::ws::{Message as ClientMessage, Utf8Bytes as ClientText},
    };
    use futures_util::{sink, stream, Sink, Stream, StreamExt};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
    use tokio_util::sync::CancellationToken;

    use super::{run, Heartbeat, Inbound, Link, TerminationReason, WireMessage};

    type Recorded<M> = Arc<Mutex<Vec<M>>>;
    type Inbox<M> = Pin<Box<dyn Stream<Item = Result<M, io::Error>> + Send>>;
    type Outbox<M> = Pin<Box<dyn Sink<M, Error = Infallible> + Send>>;

    const QUIET: Heartbeat =
        Heartbeat { interval: Duration::from_secs(3600), pong_timeout: Duration::from_secs(60) };

    fn recorder<M: Send + 'static>() -> (Recorded<M>, Outbox<M>) {
        let recorded: Recorded<M> = Arc::default();
        let sink = sink::unfold(recorded.clone(), |recorded, message: M| async move {
            recorded.lock().expect("recorder lock").push(message);
            Ok::<_, Infallible>(recorded)
        });
        (recorded, Box::pin(sink))
    }

    /// Yields `messages`, then stays open forever.
    fn inbox_then_idle<M: Send + 'static>(messages: Vec<Result<M, io::Error>>) -> Inbox<M> {
        Box::pin(stream::iter(messages).chain(stream::pending()))
    }

    /// Yields `messages`, then ends as if the peer hung up.
    fn inbox_then_eof<M: Send + 'static>(messages: Vec<Result<M, io::Error>>) -> Inbox<M> {
        Box::pin(stream::iter(messages))
    }

    fn pongs_every<M: Send + 'static>(period: Duration, pong: fn() -> M) -> Inbox<M> {
        Box::pin(stream::unfold((), move |()| async move {
            sleep(period).await;
            Some((Ok::<_, io::Error>(pong()), ()))
        }))
    }

    /// Yields one message after `delay`, then stays open forever.
    fn late_message<M: Send + 'static>(delay: Duration, message: M) -> Inbox<M> {
        Box::pin(
            stream::once(async move {
                sleep(delay).await;
                Ok::<_, io::Error>(message)
            })
            .chain(stream::pending()),
        )
    }

    fn snapshot<M: Clone>(recorded: &Recorded<M>) -> Vec<M> {
        recorded.lock().expect("recorder lock").clone()
    }

    #[tokio::test]
    async fn client_frames_reach_upstream_in_order_with_type_preserved() {
        let (to_upstream, upstream_tx) = recorder::<UpstreamMessage>();
        let (to_client, client_tx) = recorder::<ClientMessage>();
        let mut client = Link::new(
            inbox_then_idle(vec![
                Ok(ClientMessage::Text("first".into())),
                Ok(ClientMessage::Text(r#"{"type":"text","data":"hello"}"#.into())),
                Ok(ClientMessage::Binary(Bytes::from_static(&[0x00, 0xff, 0x10]))),
                Ok(ClientMessage::Text("last ✓".into())),
                Ok(ClientMessage::Close(None)),
            ]),
            client_tx,
        );
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), upstream_tx);

        let report = timeout(
            Duration::from_secs(1),
            run(&mut client, &mut upstream, QUIET, &CancellationToken::new()),
        )
        .await
        .expect("pump should stop once the client closes");

        assert_eq!(report.reason, TerminationReason::ClientClosed);
        assert_eq!(report.client_to_upstream, 4);
        assert_eq!(report.upstream_to_client, 0);
        assert_eq!(
            snapshot(&to_upstream),
            vec![
                UpstreamMessage::Text("first".into()),
                UpstreamMessage::Text(r#"{"type":"text","data":"hello"}"#.into()),
                UpstreamMessage::Binary(Bytes::from_static(&[0x00, 0xff, 0x10])),
                UpstreamMessage::Text("last ✓".into()),
            ]
        );
        assert!(snapshot(&to_client).is_empty());
    }

    #[tokio::test]
    async fn upstream_binary_frames_reach_client_in_order() {
        let (to_upstream, upstream_tx) = recorder::<UpstreamMessage>();
        let (to_client, client_tx) = recorder::<ClientMessage>();
        let mut client = Link::new(inbox_then_idle::<ClientMessage>(vec![]), client_tx);
        let mut upstream = Link::new(
            inbox_then_eof(vec![
                Ok(UpstreamMessage::Binary(Bytes::from_static(&[0x01, 0x02]))),
                Ok(UpstreamMessage::Binary(Bytes::from_static(&[0x03, 0x04]))),
            ]),
            upstream_tx,
        );

        let report = timeout(
            Duration::from_secs(1),
            run(&mut client, &mut upstream, QUIET, &CancellationToken::new()),
        )
        .await
        .expect("pump should stop once upstream ends");

        assert_eq!(report.reason, TerminationReason::UpstreamClosed);
        assert_eq!(report.upstream_to_client, 2);
        assert_eq!(
            snapshot(&to_client),
            vec![
                ClientMessage::Binary(Bytes::from_static(&[0x01, 0x02])),
                ClientMessage::Binary(Bytes::from_static(&[0x03, 0x04])),
            ]
        );
        assert!(snapshot(&to_upstream).is_empty());
    }

    #[tokio::test]
    async fn upstream_close_frame_and_end_of_stream_are_treated_alike() {
        let (_, client_tx) = recorder::<ClientMessage>();
        let (_, upstream_tx) = recorder::<UpstreamMessage>();
        let mut client = Link::new(inbox_then_idle::<ClientMessage>(vec![]), client_tx);
        let mut upstream = Link::new(
            inbox_then_idle(vec![
                Ok(UpstreamMessage::Text("bye".into())),
                Ok(UpstreamMessage::Close(None)),
            ]),
            upstream_tx,
        );

        let report = run(&mut client, &mut upstream, QUIET, &CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::UpstreamClosed);
        assert_eq!(report.upstream_to_client, 1);
    }

    #[tokio::test]
    async fn receive_errors_are_attributed_to_their_leg() {
        let (_, client_tx) = recorder::<ClientMessage>();
        let (_, upstream_tx) = recorder::<UpstreamMessage>();
        let mut client = Link::new(inbox_then_idle::<ClientMessage>(vec![]), client_tx);
        let mut upstream = Link::new(
            inbox_then_idle::<UpstreamMessage>(vec![Err(io::Error::other("reset"))]),
            upstream_tx,
        );
        let report = run(&mut client, &mut upstream, QUIET, &CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::UpstreamError);

        let (_, client_tx) = recorder::<ClientMessage>();
        let (_, upstream_tx) = recorder::<UpstreamMessage>();
        let mut client = Link::new(
            inbox_then_idle::<ClientMessage>(vec![Err(io::Error::other("reset"))]),
            client_tx,
        );
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), upstream_tx);
        let report = run(&mut client, &mut upstream, QUIET, &CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::ClientError);
    }

    #[tokio::test]
    async fn control_frames_are_not_forwarded() {
        let (to_upstream, upstream_tx) = recorder::<UpstreamMessage>();
        let (_, client_tx) = recorder::<ClientMessage>();
        let mut client = Link::new(
            inbox_then_eof(vec![
                Ok(ClientMessage::Ping(Bytes::from_static(b"p"))),
                Ok(ClientMessage::Pong(Bytes::from_static(b"q"))),
                Ok(ClientMessage::Text("payload".into())),
            ]),
            client_tx,
        );
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), upstream_tx);

        let report = run(&mut client, &mut upstream, QUIET, &CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::ClientClosed);
        assert_eq!(snapshot(&to_upstream), vec![UpstreamMessage::Text("payload".into())]);
    }

    #[tokio::test]
    async fn failed_send_ends_the_relay_as_a_close_of_that_leg() {
        let (_, client_tx) = recorder::<ClientMessage>();
        let broken_upstream = Box::pin(sink::unfold((), |(), _: UpstreamMessage| async {
            Err::<(), _>(io::Error::other("broken pipe"))
        }));
        let mut client = Link::new(
            inbox_then_idle(vec![
                Ok(ClientMessage::Text("one".into())),
                Ok(ClientMessage::Text("two".into())),
            ]),
            client_tx,
        );
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), broken_upstream);

        let report = run(&mut client, &mut upstream, QUIET, &CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::UpstreamClosed);
        assert_eq!(report.client_to_upstream, 0);
    }

    #[tokio::test]
    async fn shutdown_token_stops_an_idle_relay() {
        let (_, client_tx) = recorder::<ClientMessage>();
        let (_, upstream_tx) = recorder::<UpstreamMessage>();
        let mut client = Link::new(inbox_then_idle::<ClientMessage>(vec![]), client_tx);
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), upstream_tx);
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = timeout(
            Duration::from_secs(1),
            run(&mut client, &mut upstream, QUIET, &shutdown),
        )
        .await
        .expect("shutdown should interrupt pending receives");
        assert_eq!(report.reason, TerminationReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_both_legs_and_drops_a_silent_upstream() {
        let heartbeat =
            Heartbeat { interval: Duration::from_secs(20), pong_timeout: Duration::from_secs(10) };
        let (to_upstream, upstream_tx) = recorder::<UpstreamMessage>();
        let (to_client, client_tx) = recorder::<ClientMessage>();
        let mut client = Link::new(
            pongs_every(Duration::from_secs(5), || ClientMessage::Pong(Bytes::new())),
            client_tx,
        );
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), upstream_tx);

        let started = tokio::time::Instant::now();
        let report = run(&mut client, &mut upstream, heartbeat, &CancellationToken::new()).await;

        assert_eq!(started.elapsed(), Duration::from_secs(40));
        assert_eq!(report.reason, TerminationReason::UpstreamError);
        assert_eq!(snapshot(&to_upstream), vec![UpstreamMessage::Ping(Bytes::new())]);
        assert!(snapshot(&to_client).contains(&ClientMessage::Ping(Bytes::new())));
        assert_eq!(report.client_to_upstream, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn live_upstream_survives_while_silent_client_is_dropped() {
        let heartbeat =
            Heartbeat { interval: Duration::from_secs(20), pong_timeout: Duration::from_secs(10) };
        let (_, upstream_tx) = recorder::<UpstreamMessage>();
        let (_, client_tx) = recorder::<ClientMessage>();
        let mut client = Link::new(inbox_then_idle::<ClientMessage>(vec![]), client_tx);
        let mut upstream = Link::new(
            pongs_every(Duration::from_secs(5), || UpstreamMessage::Pong(Bytes::new())),
            upstream_tx,
        );

        let report = run(&mut client, &mut upstream, heartbeat, &CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::ClientError);
        assert_eq!(report.upstream_to_client, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upstream_send_is_detected_as_dead_peer() {
        let heartbeat =
            Heartbeat { interval: Duration::from_secs(20), pong_timeout: Duration::from_secs(10) };
        let black_hole = Box::pin(sink::unfold((), |(), _: UpstreamMessage| async {
            std::future::pending::<Result<(), Infallible>>().await
        }));
        let (_, client_tx) = recorder::<ClientMessage>();
        let audio = Ok::<_, io::Error>(ClientMessage::Binary(Bytes::from_static(&[0x10, 0x20])));
        let mut client = Link::new(
            stream::iter(vec![audio])
                .chain(pongs_every(Duration::from_secs(5), || ClientMessage::Pong(Bytes::new())))
                .boxed(),
            client_tx,
        );
        let mut upstream = Link::new(inbox_then_idle::<UpstreamMessage>(vec![]), black_hole);

        let started = tokio::time::Instant::now();
        let report = timeout(
            Duration::from_secs(600),
            run(&mut client, &mut upstream, heartbeat, &CancellationToken::new()),
        )
        .await
        .expect("a stalled send must not keep the relay open");

        assert_eq!(report.reason, TerminationReason::UpstreamError);
        assert!(started.elapsed() <= Duration::from_secs(40));
        assert_eq!(report.client_to_upstream, 0);
    }

    #[tokio::test]
    async fn nothing_reaches_the_client_after_it_closes() {
        let (_, upstream_tx) = recorder::<UpstreamMessage>();
        let (to_client, client_tx) = recorder::<ClientMessage>();
        let mut client =
            Link::new(inbox_then_idle(vec![Ok(ClientMessage::Close(None))]), client_tx);
        let mut upstream = Link::new(
            late_message(Duration::from_millis(50), UpstreamMessage::Text("too late".into())),
            upstream_tx,
        );

        let report = run(&mut client, &mut upstream, QUIET, &CancellationToken::new()).await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(report.reason, TerminationReason::ClientClosed);
        assert_eq!(report.upstream_to_client, 0);
        assert!(snapshot(&to_client).is_empty());
    }

    #[tokio::test]
    async fn reason_comes_from_the_leg_that_failed_first() {
        let slow_failing_upstream = Box::pin(sink::unfold((), |(), _: UpstreamMessage| async {
            sleep(Duration::from_millis(50)).await;
            Err::<(), _>(io::Error::other("connection reset"))
        }));
        let (_, client_tx) = recorder::<ClientMessage>();
        let mut client =
            Link::new(inbox_then_idle(vec![Ok(ClientMessage::Text("audio".into()))]), client_tx);
        let mut upstream = Link::new(
            late_message(Duration::from_millis(10), UpstreamMessage::Pong(Bytes::new()))
                .chain(stream::once(async { Err(io::Error::other("reset")) }))
                .boxed(),
            slow_failing_upstream,
        );

        let report = timeout(
            Duration::from_secs(1),
            run(&mut client, &mut upstream, QUIET, &CancellationToken::new()),
        )
        .await
        .expect("pump should stop once upstream fails");

        assert_eq!(report.reason, TerminationReason::UpstreamError);
        assert_eq!(report.client_to_upstream, 0);
    }

    #[test]
    fn text_frames_cross_legs_without_copying() {
        let text = ClientText::from(String::from(r#"{"type":"input_audio_buffer.commit"}"#));
        let origin = text.as_str().as_ptr();

        let Inbound::Frame(frame) = ClientMessage::Text(text).classify() else {
            panic!("text must classify as a data frame");
        };
        match UpstreamMessage::from_frame(frame) {
            UpstreamMessage::Text(relayed) => {
                assert_eq!(relayed.as_str(), r#"{"type":"input_audio_buffer.commit"}"#);
                assert_eq!(relayed.as_str().as_ptr(), origin);
            }
            other => panic!("expected text, got {other:?}"),
        }
    }
}
