//! Centralized entity id generation
//!
//! Every entity id comes from an `IdGenerator` before the entity is first
//! written, so no write ever targets an empty key. Ids are 20 characters:
//! 8 characters of millisecond timestamp followed by 12 random characters,
//! both drawn from an alphabet whose byte order matches its index order.
//! Ids from one generator therefore sort in creation order; inside a single
//! millisecond the random tail is incremented instead of re-rolled.

use std::sync::OnceLock;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_LEN: usize = 8;
const RANDOM_LEN: usize = 12;

/// Length of every generated id
pub const ID_LEN: usize = TIME_LEN + RANDOM_LEN;

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: i64,
    last_random: [u8; RANDOM_LEN],
}

/// Monotonic, opaque id source
#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

static GLOBAL: OnceLock<IdGenerator> = OnceLock::new();

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide generator
    pub fn global() -> &'static IdGenerator {
        GLOBAL.get_or_init(IdGenerator::new)
    }

    /// Produce the next id
    pub fn next_id(&self) -> String {
        self.next_id_at(Utc::now().timestamp_millis())
    }

    fn next_id_at(&self, now_ms: i64) -> String {
        let mut state = self.state.lock();

        if now_ms > state.last_ms {
            state.last_ms = now_ms;
            let mut rng = rand::thread_rng();
            for digit in state.last_random.iter_mut() {
                *digit = rng.gen_range(0..64);
            }
        } else if !increment(&mut state.last_random) {
            // Tail exhausted within one millisecond (or the clock went back):
            // borrow the next millisecond so ordering still holds.
            state.last_ms += 1;
            state.last_random = [0; RANDOM_LEN];
        }

        let mut id = String::with_capacity(ID_LEN);
        let mut ts = state.last_ms.max(0) as u64;
        let mut time_chars = [0u8; TIME_LEN];
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(ts % 64) as usize];
            ts /= 64;
        }
        id.extend(time_chars.iter().map(|&b| b as char));
        id.extend(state.last_random.iter().map(|&d| PUSH_CHARS[d as usize] as char));
        id
    }
}

/// Add one to a base-64 digit string; false on overflow
fn increment(digits: &mut [u8; RANDOM_LEN]) -> bool {
    for digit in digits.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return true;
        }
    }
    false
}
