//! Value types shared by ledger records: timestamps and service units
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus_days(&self, days: i64) -> Self {
        Self(self.0 + Duration::days(days))
    }
    pub fn to_iso(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, false)
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// A fixed-point amount of service units with at most two fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ServiceUnits(Decimal);

impl ServiceUnits {
    pub const ZERO: ServiceUnits = ServiceUnits(Decimal::ZERO);

    // amounts with more than two fractional digits are rounded half to even
    pub fn new(value: Decimal) -> Self {
        Self(value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven))
    }
    pub fn value(&self) -> Decimal {
        self.0
    }
    pub fn checked_add(&self, other: ServiceUnits) -> Option<ServiceUnits> {
        self.0.checked_add(other.0).map(ServiceUnits::new)
    }
}

impl From<Decimal> for ServiceUnits {
    fn from(value: Decimal) -> Self {
        ServiceUnits::new(value)
    }
}

impl FromStr for ServiceUnits {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s).map(ServiceUnits::new)
    }
}

impl fmt::Display for ServiceUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// stored as the decimal string so no precision is lost in transit
impl<C> minicbor::Encode<C> for ServiceUnits {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for ServiceUnits {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let s = d.str()?;

        Decimal::from_str(s)
            .map(ServiceUnits)
            .map_err(|_| minicbor::decode::Error::message("failed to decode service units"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn service_units_keep_their_scale() {
        let units: ServiceUnits = "100.50".parse().unwrap();

        let encoding = minicbor::to_vec(units).unwrap();
        let decode: ServiceUnits = minicbor::decode(&encoding).unwrap();

        assert_eq!(decode.to_string(), "100.50");
    }

    #[test]
    fn service_units_round_to_two_places() {
        let units: ServiceUnits = "1.005".parse().unwrap();
        assert_eq!(units.to_string(), "1.00");

        let units: ServiceUnits = "125".parse().unwrap();
        assert_eq!(units.to_string(), "125");
    }
}
