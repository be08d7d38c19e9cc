//! Path prober (C5): volleys unfulfillable test packets to discover the
//! maximum packet amount the path will carry and the exchange rate the path
//! applies, to the precision required by configuration.
//!
//! All rate arithmetic uses [`num::rational::Ratio`] over [`BigUint`]; this
//! module never touches a floating-point type, per the big-number-arithmetic
//! design note.

use num::rational::Ratio;
use num::{BigUint, Integer, ToPrimitive};
use std::time::Duration;

pub const MAX_PROBE_ATTEMPTS: usize = 20;
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(12 * 60 * 60);
const RETRY_BACKOFF_MULTIPLIER_NUM: u32 = 3;
const RETRY_BACKOFF_MULTIPLIER_DEN: u32 = 2;

pub fn initial_volley() -> Vec<u64> {
    vec![1, 1_000, 1_000_000, 1_000_000_000, 1_000_000_000_000]
}

/// Outcome of sending one unfulfillable probe packet for a given source
/// amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The other side decrypted the packet and rejected it with F99,
    /// revealing how much it would have received.
    Delivered { source_amount: u64, prepare_amount: u64 },
    /// F08: the path truncated the packet; these are the values from the
    /// reject's `MaxPacketAmountDetails`.
    TooLarge { source_amount: u64, received: u64, maximum: u64 },
    /// Txx: a temporary error, not otherwise informative.
    Temporary { source_amount: u64 },
    /// Any other final reject/path failure, which aborts discovery.
    Fatal(String),
}

/// Number of base-10 digits in `n`'s decimal representation, used as the
/// measure of how precisely a given probe response constrains the rate: a
/// prepare_amount with more digits was measured against a larger source
/// amount and so carries more significant figures.
pub fn digit_count(n: u64) -> usize {
    if n == 0 {
        1
    } else {
        let mut count = 0;
        let mut v = n;
        while v > 0 {
            count += 1;
            v /= 10;
        }
        count
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryState {
    pub max_packet_amount: u64,
    pub test_max_packet_amount: u64,
    pub exchange_rate: Option<Ratio<BigUint>>,
    pub retry_delay: Duration,
    attempts: usize,
    min_precision: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStep {
    /// Send another volley of these source amounts.
    Continue(Vec<u64>),
    /// A rate has been measured with sufficient precision.
    Done,
    /// The prober gave up: empty volley, exhausted attempts, or
    /// `max_packet_amount` collapsed to zero.
    Failed(String),
}

impl DiscoveryState {
    pub fn new(min_precision: usize) -> Self {
        DiscoveryState {
            max_packet_amount: u64::MAX,
            test_max_packet_amount: u64::MAX,
            exchange_rate: None,
            retry_delay: INITIAL_RETRY_DELAY,
            attempts: 0,
            min_precision,
        }
    }

    /// Folds one volley's worth of [`ProbeOutcome`]s into the discovery
    /// state and decides what to do next, per §4.5 steps 3-6.
    pub fn observe_volley(&mut self, outcomes: &[ProbeOutcome]) -> DiscoveryStep {
        self.attempts += 1;

        let mut f08_candidates: Vec<u64> = Vec::new();
        let mut saw_temporary = false;
        let mut smallest_tried = u64::MAX;
        let mut best: Option<(u64, u64)> = None; // (prepare_amount, source_amount)
        let mut best_digits = 0usize;

        for outcome in outcomes {
            match outcome {
                ProbeOutcome::Delivered {
                    source_amount,
                    prepare_amount,
                } => {
                    smallest_tried = smallest_tried.min(*source_amount);
                    let digits = digit_count(*prepare_amount);
                    if digits > best_digits {
                        best_digits = digits;
                        best = Some((*prepare_amount, *source_amount));
                    }
                }
                ProbeOutcome::TooLarge {
                    source_amount,
                    received,
                    maximum,
                } => {
                    smallest_tried = smallest_tried.min(*source_amount);
                    if *received > 0 {
                        let max_packet = (u128::from(*source_amount) * u128::from(*maximum))
                            / u128::from(*received);
                        f08_candidates.push(max_packet.min(u128::from(u64::MAX)) as u64);
                    }
                }
                ProbeOutcome::Temporary { source_amount } => {
                    smallest_tried = smallest_tried.min(*source_amount);
                    saw_temporary = true;
                }
                ProbeOutcome::Fatal(message) => {
                    return DiscoveryStep::Failed(message.clone());
                }
            }
        }

        if let Some(min_f08) = f08_candidates.iter().copied().min() {
            self.max_packet_amount = self.max_packet_amount.min(min_f08);
            self.test_max_packet_amount = self.max_packet_amount;
            if self.max_packet_amount == 0 {
                return DiscoveryStep::Failed(
                    "max packet amount discovered to be zero".to_string(),
                );
            }
        }

        if let Some((prepare_amount, source_amount)) = best {
            if best_digits >= self.min_precision {
                self.exchange_rate = Some(Ratio::new(
                    BigUint::from(prepare_amount),
                    BigUint::from(source_amount.max(1)),
                ));
                return DiscoveryStep::Done;
            }
        }

        if self.attempts >= MAX_PROBE_ATTEMPTS {
            return DiscoveryStep::Failed(
                "exceeded maximum path discovery attempts".to_string(),
            );
        }

        let mut next_volley: Vec<u64> = f08_candidates;
        next_volley.sort_unstable();
        next_volley.dedup();
        if saw_temporary && smallest_tried != u64::MAX {
            next_volley.push(smallest_tried - smallest_tried / 3);
            self.retry_delay = (self.retry_delay
                * RETRY_BACKOFF_MULTIPLIER_NUM
                / RETRY_BACKOFF_MULTIPLIER_DEN)
                .min(MAX_RETRY_DELAY);
        }
        next_volley.sort_unstable();
        next_volley.dedup();

        if next_volley.is_empty() {
            DiscoveryStep::Failed("path discovery volley exhausted with no candidates".to_string())
        } else {
            DiscoveryStep::Continue(next_volley)
        }
    }

    /// §4.6 step 4: grow the test ceiling after a fulfillment lands at
    /// exactly the current `test_max_packet_amount`.
    pub fn grow_test_max_packet_amount(&mut self) {
        self.test_max_packet_amount = if self.max_packet_amount != u64::MAX {
            self.test_max_packet_amount
                .saturating_add(self.max_packet_amount / 10)
                .min(self.max_packet_amount)
        } else {
            self.test_max_packet_amount.saturating_mul(2)
        };
        self.retry_delay = INITIAL_RETRY_DELAY;
    }

    /// T04 additionally shrinks the test ceiling by a third, floored at 2.
    pub fn shrink_on_t04(&mut self) {
        let shrunk = self.test_max_packet_amount - self.test_max_packet_amount / 3;
        self.test_max_packet_amount = shrunk.max(2);
    }
}

/// Rounds `amount * rate` down to the nearest integer (used for the
/// destination `prepare_amount` the sender demands at minimum).
pub fn apply_rate_floor(amount: u64, rate: &Ratio<BigUint>) -> u64 {
    let product = Ratio::from_integer(BigUint::from(amount)) * rate;
    (product.numer() / product.denom())
        .to_u64()
        .unwrap_or(u64::MAX)
}

/// Rounds `destination_amount / rate` up to the nearest integer (used for
/// the source-amount cap implied by a remote receive window).
pub fn invert_rate_ceil(destination_amount: u64, rate: &Ratio<BigUint>) -> u64 {
    if rate.numer().to_u64() == Some(0) {
        return u64::MAX;
    }
    let inverse = Ratio::new(rate.denom().clone(), rate.numer().clone());
    let product = Ratio::from_integer(BigUint::from(destination_amount)) * inverse;
    let (quotient, remainder) = product.numer().div_rem(product.denom());
    let quotient = quotient.to_u64().unwrap_or(u64::MAX);
    if remainder.eq(&BigUint::from(0u32)) {
        quotient
    } else {
        quotient.saturating_add(1)
    }
}

/// Applies `(1 - slippage)` as a further multiplier, for the final
/// prepare-amount computation in §4.6 step h.
pub fn apply_slippage(rate: &Ratio<BigUint>, slippage: &Ratio<BigUint>) -> Ratio<BigUint> {
    let one = Ratio::from_integer(BigUint::from(1u32));
    let factor = if slippage > &one {
        Ratio::from_integer(BigUint::from(0u32))
    } else {
        one - slippage.clone()
    };
    rate * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_precision_delivered_rate_s1() {
        let mut state = DiscoveryState::new(3);
        let outcomes = vec![
            ProbeOutcome::Delivered {
                source_amount: 1,
                prepare_amount: 2,
            },
            ProbeOutcome::Delivered {
                source_amount: 1_000,
                prepare_amount: 2_000,
            },
            ProbeOutcome::Delivered {
                source_amount: 1_000_000,
                prepare_amount: 2_000_000,
            },
        ];
        let step = state.observe_volley(&outcomes);
        assert_eq!(step, DiscoveryStep::Done);
        let rate = state.exchange_rate.unwrap();
        assert_eq!(rate, Ratio::new(BigUint::from(2u32), BigUint::from(1u32)));
    }

    #[test]
    fn f08_discovery_computes_max_packet_amount_s2() {
        let mut state = DiscoveryState::new(3);
        let outcomes = vec![ProbeOutcome::TooLarge {
            source_amount: 1_000_000_000,
            received: 1500,
            maximum: 1000,
        }];
        let step = state.observe_volley(&outcomes);
        assert_eq!(state.max_packet_amount, 666_666_666);
        assert_eq!(
            step,
            DiscoveryStep::Continue(vec![666_666_666])
        );
    }

    #[test]
    fn zero_max_packet_amount_is_terminal_failure() {
        let mut state = DiscoveryState::new(3);
        let outcomes = vec![ProbeOutcome::TooLarge {
            source_amount: 1,
            received: 1000,
            maximum: 0,
        }];
        let step = state.observe_volley(&outcomes);
        assert!(matches!(step, DiscoveryStep::Failed(_)));
    }

    #[test]
    fn temporary_error_appends_reduced_retry_amount_and_backs_off() {
        let mut state = DiscoveryState::new(3);
        let initial_delay = state.retry_delay;
        let outcomes = vec![ProbeOutcome::Temporary { source_amount: 900 }];
        let step = state.observe_volley(&outcomes);
        assert_eq!(step, DiscoveryStep::Continue(vec![600]));
        assert!(state.retry_delay > initial_delay);
    }

    #[test]
    fn empty_volley_is_terminal_failure() {
        let mut state = DiscoveryState::new(3);
        let step = state.observe_volley(&[]);
        assert!(matches!(step, DiscoveryStep::Failed(_)));
    }

    #[test]
    fn grow_test_max_packet_amount_adds_one_tenth_when_finite() {
        let mut state = DiscoveryState::new(3);
        state.max_packet_amount = 1000;
        state.test_max_packet_amount = 500;
        state.grow_test_max_packet_amount();
        assert_eq!(state.test_max_packet_amount, 600);
    }

    #[test]
    fn grow_test_max_packet_amount_doubles_when_unbounded() {
        let mut state = DiscoveryState::new(3);
        state.test_max_packet_amount = 500;
        state.grow_test_max_packet_amount();
        assert_eq!(state.test_max_packet_amount, 1000);
    }

    #[test]
    fn t04_shrinks_by_one_third_floored_at_two() {
        let mut state = DiscoveryState::new(3);
        state.test_max_packet_amount = 9;
        state.shrink_on_t04();
        assert_eq!(state.test_max_packet_amount, 6);
        state.test_max_packet_amount = 2;
        state.shrink_on_t04();
        assert_eq!(state.test_max_packet_amount, 2);
    }

    #[test]
    fn apply_rate_floor_rounds_down() {
        let rate = Ratio::new(BigUint::from(3u32), BigUint::from(2u32));
        assert_eq!(apply_rate_floor(5, &rate), 7); // 5 * 1.5 = 7.5 -> 7
    }

    #[test]
    fn invert_rate_ceil_rounds_up() {
        let rate = Ratio::new(BigUint::from(2u32), BigUint::from(1u32));
        assert_eq!(invert_rate_ceil(5, &rate), 3); // 5 / 2 = 2.5 -> 3
    }

    #[test]
    fn invert_rate_ceil_exact_division_does_not_round_up() {
        let rate = Ratio::new(BigUint::from(2u32), BigUint::from(1u32));
        assert_eq!(invert_rate_ceil(10, &rate), 5);
    }
}
