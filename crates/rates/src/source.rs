//! Initial rate snapshot sources

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use currency_core::{CurrencyCode, RateError, SourceError, SourceResult};

use crate::table::RateSnapshot;

/// Provider of the startup rate snapshot
#[async_trait::async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> SourceResult<RateSnapshot>;
    fn name(&self) -> &'static str;
}

/// Fixed snapshot, from configuration or tests
#[derive(Debug, Clone)]
pub struct StaticRateSource {
    snapshot: RateSnapshot,
}

impl StaticRateSource {
    pub fn new(snapshot: RateSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn from_config(base: CurrencyCode, rates: &BTreeMap<String, f64>) -> Result<Self, RateError> {
        let rates = rates
            .iter()
            .map(|(code, rate)| Ok((CurrencyCode::new(code)?, *rate)))
            .collect::<Result<HashMap<_, _>, RateError>>()?;

        Ok(Self::new(RateSnapshot::new(base, rates)))
    }
}

#[async_trait::async_trait]
impl RateSource for StaticRateSource {
    async fn fetch(&self) -> SourceResult<RateSnapshot> {
        if self.snapshot.rates.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(self.snapshot.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// European Central Bank daily reference rates, quoted against EUR
#[derive(Debug, Clone)]
pub struct EcbRateSource {
    url: String,
    client: reqwest::Client,
}

impl EcbRateSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl RateSource for EcbRateSource {
    async fn fetch(&self) -> SourceResult<RateSnapshot> {
        info!("Fetching reference rates from {}", self.url);

        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let body = resp.text().await.map_err(|e| SourceError::Http(e.to_string()))?;
        let snapshot = parse_ecb_xml(&body)?;

        info!(currencies = snapshot.rates.len(), "Got reference rates");
        Ok(snapshot)
    }

    fn name(&self) -> &'static str {
        "ecb"
    }
}

// <gesmes:Envelope>
//   <Cube>
//     <Cube time="2020-03-27">
//       <Cube currency="USD" rate="1.0977"/>
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Cube")]
    cube: OuterCube,
}

#[derive(Debug, Deserialize)]
struct OuterCube {
    #[serde(rename = "Cube", default)]
    days: Vec<DayCube>,
}

#[derive(Debug, Deserialize)]
struct DayCube {
    #[serde(rename = "@time")]
    time: Option<String>,
    #[serde(rename = "Cube", default)]
    rates: Vec<RateCube>,
}

#[derive(Debug, Deserialize)]
struct RateCube {
    #[serde(rename = "@currency")]
    currency: String,
    #[serde(rename = "@rate")]
    rate: String,
}

/// Parse the ECB reference rate document. EUR is added as the base with
/// rate 1.0; any unparsable rate fails the whole document.
pub fn parse_ecb_xml(xml: &str) -> SourceResult<RateSnapshot> {
    let envelope: Envelope =
        quick_xml::de::from_str(xml).map_err(|e| SourceError::Parse(e.to_string()))?;

    let mut rates = HashMap::new();
    for day in envelope.cube.days {
        debug!(time = ?day.time, entries = day.rates.len(), "Parsing reference rates");

        for cube in day.rates {
            let code = CurrencyCode::new(&cube.currency)?;
            let rate: f64 = cube.rate.trim().parse().map_err(|_| {
                SourceError::Parse(format!("invalid rate {:?} for {}", cube.rate, code))
            })?;
            rates.insert(code, rate);
        }
    }

    if rates.is_empty() {
        return Err(SourceError::Empty);
    }

    rates.insert(CurrencyCode::EUR, 1.0);
    Ok(RateSnapshot::new(CurrencyCode::EUR, rates))
}
