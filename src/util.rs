use rand::SeedableRng as _;
use rand_chacha::ChaChaRng;
use std::cell::RefCell;
use std::time::Duration;
use std::{env, process};

thread_local! {
    static RNG: RefCell<ChaChaRng> = RefCell::new(ChaChaRng::from_entropy());
}

/// A random integer in `lo..=hi`.
pub fn rand_range(lo: u32, hi: u32) -> u32 {
    use rand::Rng as _;

    RNG.with(|rng| rng.borrow_mut().gen_range(lo..=hi))
}

/// Scales the given duration by a uniform random factor in `[0.5, 1.5)`.
///
/// Applied to reconnect delays so that a herd of daemons started by the same
/// outage does not hammer the server in lockstep.
pub fn jitter(d: Duration) -> Duration {
    use rand::Rng as _;

    let factor = RNG.with(|rng| rng.borrow_mut().gen_range(0.5..1.5));
    d.mul_f64(factor)
}

/// A token to put in PING messages, unlikely to repeat within a session.
pub fn ping_token() -> String {
    use rand::Rng as _;

    let n: u64 = RNG.with(|rng| rng.borrow_mut().gen());
    format!("{:016x}", n)
}

/// The default nick: process name plus a pid-derived suffix, so that several
/// daemons on one host do not collide on their first try.
pub fn default_nick() -> String {
    let name = env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());
    format!("{}{:03}", name, process::id() % 1000)
}
