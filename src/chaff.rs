//! Decoy ("chaff") traffic
//!
//! Real users who test positive call verify, then (Google servers)
//! certificate, then publish. To keep that sequence from identifying them,
//! every device sends the same sequence with random content at a random
//! time within the configured window. Decoy requests carry `X-Chaff: chaff`
//! so servers can drop them.

use crate::calendar::{start_of_day, Clock};
use crate::error::StoreError;
use crate::network::{ChaffEndpoint, KeyServerType, ServerApi};
use crate::risk::config::MAX_CHAFF_WINDOW_DAYS;
use crate::store::{ExposureStore, StateKey};
use chrono::{DateTime, Duration as ChronoDuration, Local};
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::{json, Value};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

const PADDING_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Seconds a real user spends between verify and publish
pub const USER_DELAY_SECS: Range<u64> = 3..20;

const PADDING_LENGTH: Range<usize> = 50..200;

/// Exposure keys in a decoy publish
const PUBLISH_KEY_COUNT: Range<usize> = 1..15;

/// Rolling period of a daily key (10 minute intervals)
const ROLLING_PERIOD: i64 = 144;

/// Chaff settings taken from the server risk config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChaffSettings {
    pub enabled: bool,
    pub window_days: i64,
}

/// Random string over `a-z0-9`
pub fn random_padding<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| PADDING_ALPHABET[rng.gen_range(0..PADDING_ALPHABET.len())] as char)
        .collect()
}

fn padding() -> String {
    let len = rand::thread_rng().gen_range(PADDING_LENGTH);
    random_padding(&mut OsRng, len)
}

/// Next decoy time: local midnight plus 1..=window days
///
/// The window is clamped to `1..=MAX_CHAFF_WINDOW_DAYS`.
pub fn next_chaff_date<R: Rng + ?Sized>(now: DateTime<Local>, window_days: i64, rng: &mut R) -> i64 {
    let offset = rng.gen_range(1..=window_days.clamp(1, MAX_CHAFF_WINDOW_DAYS));
    (start_of_day(now) + ChronoDuration::days(offset)).timestamp_millis()
}

pub fn verify_body(server_type: KeyServerType) -> Value {
    match server_type {
        KeyServerType::NearForm => json!({
            "hash": random_padding(&mut OsRng, 256),
            "padding": padding(),
        }),
        KeyServerType::GoogleRefServer => json!({
            "code": random_padding(&mut OsRng, 8),
            "padding": padding(),
        }),
    }
}

pub fn certificate_body() -> Value {
    json!({
        "token": random_padding(&mut OsRng, 50),
        "ekeyhmac": random_padding(&mut OsRng, 44),
        "padding": padding(),
    })
}

pub fn publish_body(server_type: KeyServerType, now: DateTime<Local>) -> Value {
    let key_count = rand::thread_rng().gen_range(PUBLISH_KEY_COUNT);
    let today_interval = now.timestamp() / 600 / ROLLING_PERIOD * ROLLING_PERIOD;

    match server_type {
        KeyServerType::NearForm => {
            let exposures: Vec<Value> = (0..key_count)
                .map(|i| {
                    json!({
                        "keyData": random_padding(&mut OsRng, 16),
                        "rollingPeriod": ROLLING_PERIOD,
                        "rollingStartNumber": today_interval - ROLLING_PERIOD * i as i64,
                        "transmissionRiskLevel": 1,
                    })
                })
                .collect();
            json!({
                "token": random_padding(&mut OsRng, 16),
                "platform": std::env::consts::OS,
                "deviceVerificationPayload": random_padding(&mut OsRng, 128),
                "exposures": exposures,
                "padding": padding(),
            })
        }
        KeyServerType::GoogleRefServer => {
            let keys: Vec<Value> = (0..key_count)
                .map(|i| {
                    json!({
                        "key": random_padding(&mut OsRng, 16),
                        "rollingPeriod": ROLLING_PERIOD,
                        "rollingStartNumber": today_interval - ROLLING_PERIOD * i as i64,
                        "transmissionRisk": 1,
                    })
                })
                .collect();
            json!({
                "hmacKey": random_padding(&mut OsRng, 16),
                "healthAuthorityID": "chaff",
                "verificationPayload": random_padding(&mut OsRng, 128),
                "symptomOnsetInterval": today_interval,
                "revisionToken": "",
                "traveler": false,
                "temporaryExposureKeys": keys,
                "padding": padding(),
            })
        }
    }
}

pub struct ChaffGenerator {
    api: Arc<dyn ServerApi>,
    store: Arc<dyn ExposureStore>,
    clock: Clock,
}

impl ChaffGenerator {
    pub fn new(api: Arc<dyn ServerApi>, store: Arc<dyn ExposureStore>, clock: Clock) -> Self {
        Self { api, store, clock }
    }

    /// Send decoy traffic if it is due or forced
    ///
    /// # Returns
    /// `Ok(true)` when a decoy sequence was attempted
    pub async fn run(&self, settings: ChaffSettings, force: bool) -> Result<bool, StoreError> {
        let now = (self.clock)();
        let mut next = self.store.get_state_i64(StateKey::NextChaffDate).await?;

        if settings.enabled && next.is_none() {
            let date = next_chaff_date(now, settings.window_days, &mut rand::thread_rng());
            self.store
                .set_state(StateKey::NextChaffDate, &date.to_string())
                .await?;
            log::debug!("Scheduled first chaff request at {}", date);
            next = Some(date);
        }

        let due = settings.enabled && next.map_or(false, |date| now.timestamp_millis() >= date);
        if !due && !force {
            return Ok(false);
        }

        log::info!("🌾 Sending chaff requests (forced: {})", force);
        self.send_sequence().await;

        let date = next_chaff_date((self.clock)(), settings.window_days, &mut rand::thread_rng());
        self.store
            .set_state(StateKey::NextChaffDate, &date.to_string())
            .await?;
        log::debug!("Next chaff request at {}", date);

        Ok(true)
    }

    async fn send_sequence(&self) {
        let server_type = self.api.key_server_type();

        if !self.send(ChaffEndpoint::Verify, verify_body(server_type)).await {
            return;
        }

        let delay = rand::thread_rng().gen_range(USER_DELAY_SECS);
        tokio::time::sleep(Duration::from_secs(delay)).await;

        if server_type == KeyServerType::GoogleRefServer
            && !self.send(ChaffEndpoint::Certificate, certificate_body()).await
        {
            return;
        }

        self.send(ChaffEndpoint::Publish, publish_body(server_type, (self.clock)()))
            .await;
    }

    async fn send(&self, endpoint: ChaffEndpoint, body: Value) -> bool {
        match self.api.post_chaff(endpoint, &body).await {
            Ok(()) => {
                log::debug!("   ├─ Chaff {:?} sent", endpoint);
                true
            }
            Err(e) => {
                log::warn!("   └─ Chaff {:?} failed: {}", endpoint, e);
                false
            }
        }
    }
}
