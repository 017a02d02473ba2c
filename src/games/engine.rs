//! Slot outcome engine
//!
//! Win/lose is decided first with a single Bernoulli draw, then symbols are
//! chosen to match the decision. The win predicate itself is never stored:
//! it is always recomputed from the three symbols.

use crate::config::GameConfig;
use crate::errors::{ConfigurationError, SpinwireResult};
use crate::games::types::{is_winning_line, Symbol};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Raw outcome of one spin, before it is attributed to a player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpinOutcome {
    pub symbols: [Symbol; 3],
    pub payout: f64,
}

impl SpinOutcome {
    pub fn win(&self) -> bool {
        is_winning_line(&self.symbols)
    }
}

/// Symbol weights used when drawing reels
#[derive(Debug, Clone)]
pub struct Paytable {
    weights: [u32; 6],
    dist: WeightedIndex<u32>,
}

impl Paytable {
    /// Weights indexed like `Symbol::ALL`
    pub const DEFAULT_WEIGHTS: [u32; 6] = [60, 20, 10, 6, 3, 1];

    pub fn new(weights: [u32; 6]) -> Option<Self> {
        let dist = WeightedIndex::new(weights).ok()?;
        Some(Self { weights, dist })
    }

    pub fn weight(&self, symbol: Symbol) -> u32 {
        self.weights[symbol.index()]
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Symbol {
        Symbol::ALL[self.dist.sample(rng)]
    }

    /// Weighted mean multiplier of a winning line
    pub fn expected_multiplier(&self) -> f64 {
        let total: u32 = self.weights.iter().sum();
        Symbol::ALL
            .iter()
            .map(|s| s.multiplier() * self.weight(*s) as f64)
            .sum::<f64>()
            / total as f64
    }
}

impl Default for Paytable {
    fn default() -> Self {
        let dist = match WeightedIndex::new(Self::DEFAULT_WEIGHTS) {
            Ok(dist) => dist,
            Err(_) => unreachable!("default weights are positive"),
        };
        Self {
            weights: Self::DEFAULT_WEIGHTS,
            dist,
        }
    }
}

pub struct SlotEngine {
    paytable: Paytable,
    win_probability: f64,
}

impl SlotEngine {
    /// Returns `None` if `win_probability` is outside [0, 1]
    pub fn new(paytable: Paytable, win_probability: f64) -> Option<Self> {
        if !(0.0..=1.0).contains(&win_probability) {
            return None;
        }
        Some(Self {
            paytable,
            win_probability,
        })
    }

    pub fn from_config(config: &GameConfig) -> SpinwireResult<Self> {
        Self::new(Paytable::default(), config.win_probability).ok_or_else(|| {
            ConfigurationError::InvalidValue {
                field: "game.win_probability".to_string(),
                value: config.win_probability.to_string(),
                reason: "must be within [0, 1]".to_string(),
            }
            .into()
        })
    }

    pub fn paytable(&self) -> &Paytable {
        &self.paytable
    }

    pub fn win_probability(&self) -> f64 {
        self.win_probability
    }

    /// Long-run payout / bet ratio
    pub fn theoretical_rtp(&self) -> f64 {
        self.win_probability * self.paytable.expected_multiplier()
    }

    pub fn spin(&self, bet: f64) -> SpinOutcome {
        self.spin_with(&mut rand::thread_rng(), bet)
    }

    pub fn spin_with<R: Rng + ?Sized>(&self, rng: &mut R, bet: f64) -> SpinOutcome {
        let symbols = if rng.gen_bool(self.win_probability) {
            [self.paytable.draw(rng); 3]
        } else {
            self.losing_line(rng)
        };

        let payout = if is_winning_line(&symbols) {
            bet * symbols[0].multiplier()
        } else {
            0.0
        };

        SpinOutcome { symbols, payout }
    }

    fn losing_line<R: Rng + ?Sized>(&self, rng: &mut R) -> [Symbol; 3] {
        let mut symbols = [
            self.paytable.draw(rng),
            self.paytable.draw(rng),
            self.paytable.draw(rng),
        ];

        if is_winning_line(&symbols) {
            // Break the accidental match on one reel
            let reel = rng.gen_range(0..3);
            let shift = rng.gen_range(1..Symbol::ALL.len());
            let replaced = (symbols[reel].index() + shift) % Symbol::ALL.len();
            symbols[reel] = Symbol::ALL[replaced];
        }
        symbols
    }
}

impl Default for SlotEngine {
    fn default() -> Self {
        Self {
            paytable: Paytable::default(),
            win_probability: 0.30,
        }
    }
}
