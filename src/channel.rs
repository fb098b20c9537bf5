//! Per-channel send queue, pacing and membership.
//!
//! A channel session is one pacer task plus the bounded queue it drains.  The
//! server session pushes lines on the queue as requests come in; the pacer
//! joins the channel when there is something to deliver, emits PRIVMSGs no
//! faster than the flood threshold allows, and parts once the channel has
//! been idle for long enough.

use crate::config::Settings;
use crate::lines;
use irked_tokens::{line, Buffer, Command, MESSAGE_LENGTH};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{self, Instant};

/// Membership of a channel, as last reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JoinState {
    NotJoined,
    Joined,
    Denied(DenyReason),
}

/// Why a JOIN was rejected.  All of these tear the channel session down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DenyReason {
    NoSuchChannel,
    Full,
    InviteOnly,
    Banned,
    BadKey,
    Unavailable,
}

impl DenyReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::NoSuchChannel => "no such channel",
            Self::Full => "channel is full",
            Self::InviteOnly => "channel is invite-only",
            Self::Banned => "banned from channel",
            Self::BadKey => "bad channel key",
            Self::Unavailable => "channel temporarily unavailable",
        }
    }
}

/// Sent to the server session when a channel session ends.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Gone { name: String },
}

/// Outcome of waiting on the queue.
enum Next {
    /// There is a head line to deliver; call `take_head` once the channel is
    /// ready for it.
    Ready,
    /// Queue empty past the idle deadline.
    Idle,
    /// Queue closed from the other side.
    Closed,
}

/// What `push` did with the line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Pushed {
    Queued,
    /// The oldest line was dropped to make room; the counter is the total
    /// number of lines this queue has ever dropped.
    DroppedOldest(u64),
}

struct Inner {
    queue: VecDeque<String>,
    dead: bool,
    overflowed: u64,
    last_activity: Instant,
}

/// The bounded FIFO between a server session and one pacer task.
///
/// Exactly two tasks touch it: the server session pushes, the pacer peeks and
/// pops.  Overflow drops the oldest line so that a runaway producer cannot
/// wedge the queue with stale traffic.
pub(crate) struct ChannelQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    cap: usize,
}

impl ChannelQueue {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dead: false,
                overflowed: 0,
                last_activity: Instant::now(),
            }),
            notify: Notify::new(),
            cap,
        }
    }

    /// Appends a line; on overflow the oldest line is dropped.
    ///
    /// Gives the line back when the queue is already closed, so the caller
    /// can re-create the channel session and retry.
    pub(crate) fn push(&self, line: String) -> Result<Pushed, String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead {
            return Err(line);
        }
        let mut res = Pushed::Queued;
        if inner.queue.len() >= self.cap {
            inner.queue.pop_front();
            inner.overflowed += 1;
            res = Pushed::DroppedOldest(inner.overflowed);
        }
        inner.queue.push_back(line);
        inner.last_activity = Instant::now();
        drop(inner);
        self.notify.notify_one();
        Ok(res)
    }

    /// Waits until there is a head line to deliver, the idle deadline passes
    /// with an empty queue, or the queue is closed.
    async fn next(&self, ttl: Duration) -> Next {
        loop {
            let deadline = {
                let inner = self.inner.lock().unwrap();
                if inner.dead {
                    return Next::Closed;
                }
                if !inner.queue.is_empty() {
                    return Next::Ready;
                }
                inner.last_activity + ttl
            };
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = time::sleep_until(deadline) => {
                    let inner = self.inner.lock().unwrap();
                    if !inner.dead && inner.queue.is_empty() && inner.last_activity + ttl <= Instant::now() {
                        return Next::Idle;
                    }
                }
            }
        }
    }

    /// Pops the head line.
    ///
    /// The pacer calls this only once the channel is joined and paced: until
    /// then the line stays visible in the queue, where overflow may displace
    /// it and the reconnect logic can see it as pending work.
    fn take_head(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.queue.pop_front();
        inner.last_activity = Instant::now();
        head
    }

    /// Closes the queue if it is empty; the emptiness check and the close
    /// happen under one lock so a racing `push` either lands before the close
    /// or gets its line back.
    pub(crate) fn close_if_empty(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queue.is_empty() {
            return false;
        }
        inner.dead = true;
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Closes the queue unconditionally, dropping its contents.
    ///
    /// Returns the number of lines thrown away.
    pub(crate) fn close(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.dead = true;
        let dropped = inner.queue.len();
        inner.queue.clear();
        drop(inner);
        self.notify.notify_one();
        dropped
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.inner.lock().unwrap().dead
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.inner.lock().unwrap().last_activity
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

/// Client-side rate limiter, a token bucket tuned to the common "1 message
/// per second, burst of 4" flood threshold.
pub(crate) struct Pacing {
    burst: f64,
    gap: Duration,
    tokens: f64,
    last: Option<Instant>,
}

impl Pacing {
    pub(crate) fn new(burst: u32, gap: Duration) -> Self {
        Self {
            burst: f64::from(burst),
            gap,
            tokens: f64::from(burst),
            last: None,
        }
    }

    /// How long the caller must wait before sending the next message.
    ///
    /// The caller is expected to actually wait the returned duration before
    /// sending; the bucket advances its clock to that send instant.
    pub(crate) fn next_delay(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last);
            let refill = elapsed.as_secs_f64() / self.gap.as_secs_f64();
            self.tokens = (self.tokens + refill).min(self.burst);
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.last = Some(now);
            Duration::from_secs(0)
        } else {
            let wait = self.gap.mul_f64(1.0 - self.tokens);
            self.tokens = 0.0;
            self.last = Some(now + wait);
            wait
        }
    }
}

/// The PRIVMSG payload budget for the given channel.
///
/// 512 bytes of line, minus CRLF, minus `PRIVMSG `, minus ` :`.
pub(crate) fn payload_limit(channel: &str) -> usize {
    MESSAGE_LENGTH - 2 - "PRIVMSG ".len() - " :".len() - channel.len()
}

/// Splits one logical line into chunks that fit `limit` bytes, preferring to
/// break at whitespace.  Chunks come out in order; a chunk is never empty.
pub(crate) fn split_line(text: &str, limit: usize) -> Vec<&str> {
    let limit = limit.max(1);
    let mut res = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        match rest[..cut].rfind(' ') {
            Some(space) if space > 0 => {
                res.push(&rest[..space]);
                rest = &rest[space + 1..];
            }
            _ => {
                if cut == 0 {
                    // a single character wider than the limit; ship it whole
                    cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
                }
                res.push(&rest[..cut]);
                rest = &rest[cut..];
            }
        }
    }
    res.push(rest);
    res
}

/// Everything a pacer task needs.
pub(crate) struct Ctx {
    pub name: String,
    pub key: Option<String>,
    pub server: String,
    pub queue: Arc<ChannelQueue>,
    pub outbound: mpsc::UnboundedSender<String>,
    pub ready: watch::Receiver<bool>,
    pub joined: watch::Receiver<JoinState>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub settings: Arc<Settings>,
}

enum Exit {
    ServerGone,
    Denied(DenyReason),
}

/// The pacer task of one channel session.
///
/// Moves lines from the queue to the server writer at the permitted rate,
/// joining the channel on demand and idling out when there is nothing left
/// to do.
pub(crate) async fn run(mut ctx: Ctx) {
    let mut pacing = Pacing::new(ctx.settings.burst, ctx.settings.flood_gap);
    loop {
        match ctx.queue.next(ctx.settings.channel_ttl).await {
            Next::Ready => match deliver(&mut ctx, &mut pacing).await {
                Ok(()) => {}
                Err(Exit::ServerGone) => return,
                Err(Exit::Denied(_)) => {
                    // the server session flushed the queue and logged when it
                    // saw the rejection numeric
                    let _ = ctx.queue.close();
                    let _ = ctx.events.send(ChannelEvent::Gone {
                        name: ctx.name.clone(),
                    });
                    return;
                }
            },
            Next::Idle => {
                if ctx.queue.close_if_empty() {
                    log::info!("{}: leaving idle channel {}", ctx.server, ctx.name);
                    part(&ctx, lines::PART_IDLE);
                    let _ = ctx.events.send(ChannelEvent::Gone {
                        name: ctx.name.clone(),
                    });
                    return;
                }
            }
            Next::Closed => {
                part(&ctx, lines::PART_SCAVENGED);
                let _ = ctx.events.send(ChannelEvent::Gone {
                    name: ctx.name.clone(),
                });
                return;
            }
        }
    }
}

/// Delivers the head line: waits for the connection and the membership,
/// paces, then hands the PRIVMSG to the server writer.
///
/// The head is only popped at the last moment, after all the waiting; see
/// `ChannelQueue::take_head`.  Empty lines join the channel without emitting
/// anything; producers use them to open a channel ahead of traffic.
async fn deliver(ctx: &mut Ctx, pacing: &mut Pacing) -> Result<(), Exit> {
    ensure_joined(ctx).await?;
    let text = match ctx.queue.take_head() {
        Some(text) => text,
        None => return Ok(()),
    };
    if text.is_empty() {
        return Ok(());
    }
    let wait = pacing.next_delay(Instant::now());
    if wait > Duration::from_secs(0) {
        time::sleep(wait).await;
    }
    ctx.outbound
        .send(line(Command::PrivMsg, &[&ctx.name], &text))
        .map_err(|_| Exit::ServerGone)
}

/// Waits until the server connection is up and this channel is joined.
///
/// Sends JOIN whenever membership is missing, and starts over when the
/// connection drops mid-handshake.  Join rejections surface as `Denied`;
/// everything else is retried for as long as the server session lives, its
/// PING machinery being what bounds a silent server.
async fn ensure_joined(ctx: &mut Ctx) -> Result<(), Exit> {
    'reconnect: loop {
        if ctx.ready.wait_for(|ready| *ready).await.is_err() {
            return Err(Exit::ServerGone);
        }
        match *ctx.joined.borrow() {
            JoinState::Joined => return Ok(()),
            JoinState::Denied(reason) => return Err(Exit::Denied(reason)),
            JoinState::NotJoined => {}
        }

        let mut buf = Buffer::new();
        {
            let msg = buf.message(Command::Join).param(&ctx.name);
            if let Some(ref key) = ctx.key {
                msg.param(key);
            }
        }
        if ctx.outbound.send(buf.build()).is_err() {
            return Err(Exit::ServerGone);
        }

        loop {
            tokio::select! {
                changed = ctx.joined.changed() => {
                    if changed.is_err() {
                        return Err(Exit::ServerGone);
                    }
                    match *ctx.joined.borrow() {
                        JoinState::Joined => return Ok(()),
                        JoinState::Denied(reason) => return Err(Exit::Denied(reason)),
                        JoinState::NotJoined => continue 'reconnect,
                    }
                }
                changed = ctx.ready.changed() => {
                    if changed.is_err() {
                        return Err(Exit::ServerGone);
                    }
                    if !*ctx.ready.borrow() {
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

/// Parts the channel if the daemon is actually on it.
fn part(ctx: &Ctx, reason: &str) {
    if *ctx.ready.borrow() && *ctx.joined.borrow() == JoinState::Joined {
        let _ = ctx.outbound.send(line(Command::Part, &[&ctx.name], reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let q = ChannelQueue::new(8);
        q.push("a".to_owned()).unwrap();
        q.push("b".to_owned()).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.take_head().as_deref(), Some("a"));
        assert_eq!(q.take_head().as_deref(), Some("b"));
        assert_eq!(q.take_head(), None);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let q = ChannelQueue::new(2);
        assert_eq!(q.push("a".to_owned()), Ok(Pushed::Queued));
        assert_eq!(q.push("b".to_owned()), Ok(Pushed::Queued));
        assert_eq!(q.push("c".to_owned()), Ok(Pushed::DroppedOldest(1)));
        assert_eq!(q.push("d".to_owned()), Ok(Pushed::DroppedOldest(2)));
        assert_eq!(q.len(), 2);

        let mut inner = q.inner.lock().unwrap();
        assert_eq!(inner.queue.pop_front().as_deref(), Some("c"));
        assert_eq!(inner.queue.pop_front().as_deref(), Some("d"));
    }

    #[test]
    fn test_queue_close_gives_lines_back() {
        let q = ChannelQueue::new(8);
        assert!(q.close_if_empty());
        assert_eq!(q.push("late".to_owned()), Err("late".to_owned()));
    }

    #[test]
    fn test_queue_close_if_empty_refuses_pending() {
        let q = ChannelQueue::new(8);
        q.push("pending".to_owned()).unwrap();
        assert!(!q.close_if_empty());
        assert_eq!(q.close(), 1);
    }

    #[test]
    fn test_pacing_burst_then_gap() {
        let gap = Duration::from_secs(1);
        let mut pacing = Pacing::new(4, gap);
        let mut now = Instant::now();
        for _ in 0..4 {
            assert_eq!(pacing.next_delay(now), Duration::from_secs(0));
        }
        // burst spent; each further message waits a full gap
        for _ in 0..3 {
            let wait = pacing.next_delay(now);
            assert_eq!(wait, gap);
            now += wait;
        }
    }

    #[test]
    fn test_pacing_refills() {
        let gap = Duration::from_secs(1);
        let mut pacing = Pacing::new(4, gap);
        let start = Instant::now();
        for _ in 0..4 {
            pacing.next_delay(start);
        }
        // ten gaps of quiet refill the bucket back to (at most) burst
        let later = start + Duration::from_secs(10);
        for _ in 0..4 {
            assert_eq!(pacing.next_delay(later), Duration::from_secs(0));
        }
        assert_eq!(pacing.next_delay(later), gap);
    }

    #[test]
    fn test_split_short_line_untouched() {
        assert_eq!(split_line("hello", 100), vec!["hello"]);
        assert_eq!(split_line("", 100), vec![""]);
    }

    #[test]
    fn test_split_prefers_whitespace() {
        assert_eq!(
            split_line("one two three", 9),
            vec!["one two", "three"],
        );
    }

    #[test]
    fn test_split_hard_cut_without_whitespace() {
        assert_eq!(split_line("abcdefgh", 3), vec!["abc", "def", "gh"]);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        // 'é' is two bytes; a cut may not land inside it
        let chunks = split_line("ééééé", 3);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 3);
        }
        assert_eq!(chunks.concat(), "ééééé");
    }

    #[test]
    fn test_payload_limit_matches_framing() {
        assert_eq!(payload_limit("#chan"), 500 - "#chan".len());
    }
}
