use std::io::{self, Write};

use access_log::CommonLog;
use chrono::{DateTime, SecondsFormat};
use rand::prelude::*;
use rand_distr::{Uniform, Zipf};
use thiserror::Error;

const MAX_BYTES: u64 = 10_000;
const START_SECS: i64 = 1_560_960_000; // 2019-06-19T16:00:00Z

const PAGES: &[&str] = &["index", "about", "eucharya", "products", "search", "cart", "checkout"];
const RESPONSES: &[i32] = &[200, 200, 200, 200, 301, 404, 500];
const AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64)",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
    "Opera/9.80 (Windows NT 6.1; U; en)",
    "curl/8.5.0",
];

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("invalid distribution: {0}")]
    Distribution(String),
    #[error("failed to serialise record: {0}")]
    Serialise(#[from] serde_json::Error),
    #[error("failed to write dataset: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub elements: usize,
    pub users: usize,
    /// Zipf exponent for the user distribution. Uniform when unset.
    pub zipf: Option<f64>,
    pub seed: u64,
}

enum KeyDistr {
    Uniform(Uniform<u64>),
    Zipf(Zipf<f64>),
}

impl KeyDistr {
    fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        match self {
            KeyDistr::Uniform(d) => d.sample(rng),
            // Zipf samples lie in [1, n].
            KeyDistr::Zipf(d) => d.sample(rng) as u64 - 1,
        }
    }
}

/// Writes `elements` synthetic access log events as JSON lines. Returns the number written.
pub fn generate_dataset<W: Write>(mut out: W, options: &GenerateOptions) -> Result<usize, GenerateError> {
    let users = options.users as u64;
    let key_distr = match options.zipf {
        Some(s) => KeyDistr::Zipf(Zipf::new(users as f64, s).map_err(|e| GenerateError::Distribution(e.to_string()))?),
        None => KeyDistr::Uniform(Uniform::new(0, users).map_err(|e| GenerateError::Distribution(e.to_string()))?),
    };
    let value_distr = Uniform::new_inclusive(0, MAX_BYTES).map_err(|e| GenerateError::Distribution(e.to_string()))?;
    let mut rng = SmallRng::seed_from_u64(options.seed);

    for idx in 0..options.elements {
        let record = CommonLog {
            ip: format!(
                "{}.{}.{}.{}",
                rng.random_range(1..=223u8),
                rng.random::<u8>(),
                rng.random::<u8>(),
                rng.random_range(1..=254u8)
            ),
            user_id: format!("user-{}", key_distr.sample(&mut rng)),
            lat: rng.random_range(-90.0..90.0),
            lng: rng.random_range(-180.0..180.0),
            timestamp: DateTime::from_timestamp(START_SECS + idx as i64, 0)
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
                .unwrap_or_default(),
            http_request: format!("\"GET {}.html HTTP/1.0\"", PAGES.choose(&mut rng).unwrap_or(&"index")),
            http_response: *RESPONSES.choose(&mut rng).unwrap_or(&200),
            num_bytes: value_distr.sample(&mut rng),
            user_agent: AGENTS.choose(&mut rng).unwrap_or(&"curl/8.5.0").to_string(),
        };
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(options.elements)
}
