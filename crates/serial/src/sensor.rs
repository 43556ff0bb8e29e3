//! Best-effort extraction of sensor readings from free-form serial lines.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_unit: Option<String>,
}

impl SensorReading {
    pub fn is_empty(&self) -> bool {
        *self == SensorReading::default()
    }
}

struct Patterns {
    temperature: Regex,
    humidity: Regex,
    pressure: Regex,
    motion: Regex,
    distance: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        temperature: Regex::new(r"(?i)\b(?:temperature|temp)\s*[:=]?\s*(-?\d+(?:\.\d+)?)")
            .expect("temperature regex"),
        humidity: Regex::new(r"(?i)\b(?:humidity|hum|rh)\s*[:=]?\s*(\d+(?:\.\d+)?)")
            .expect("humidity regex"),
        pressure: Regex::new(r"(?i)\b(?:pressure|press|pres)\s*[:=]?\s*(\d+(?:\.\d+)?)")
            .expect("pressure regex"),
        motion: Regex::new(r"(?i)\bmotion\s*[:=]?\s*(true|false|yes|no|detected|none|1|0)\b")
            .expect("motion regex"),
        distance: Regex::new(
            r"(?i)\b(?:distance|dist)\s*[:=]?\s*(\d+(?:\.\d+)?)\s*(cm|mm|m|inches|inch|in)?\b",
        )
        .expect("distance regex"),
    })
}

fn number(pattern: &Regex, line: &str) -> Option<f64> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Each field is matched independently; fields that do not appear stay `None`.
pub fn parse_sensor_data(line: &str) -> SensorReading {
    let p = patterns();
    let motion = p
        .motion
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| {
            matches!(
                m.as_str().to_ascii_lowercase().as_str(),
                "true" | "yes" | "detected" | "1"
            )
        });
    let (distance, distance_unit) = match p.distance.captures(line) {
        Some(caps) => (
            caps.get(1).and_then(|m| m.as_str().parse().ok()),
            caps.get(2).map(|m| m.as_str().to_ascii_lowercase()),
        ),
        None => (None, None),
    };

    SensorReading {
        temperature: number(&p.temperature, line),
        humidity: number(&p.humidity, line),
        pressure: number(&p.pressure, line),
        motion,
        distance,
        distance_unit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_and_humidity() {
        let reading = parse_sensor_data("temp:25.3 humidity:60.2");
        assert_eq!(reading.temperature, Some(25.3));
        assert_eq!(reading.humidity, Some(60.2));
        assert_eq!(reading.pressure, None);
        assert_eq!(reading.motion, None);
        assert_eq!(reading.distance, None);

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json, serde_json::json!({"temperature": 25.3, "humidity": 60.2}));
    }

    #[test]
    fn motion_and_distance_with_unit() {
        let reading = parse_sensor_data("Motion: detected, Distance = 42.5 cm");
        assert_eq!(reading.motion, Some(true));
        assert_eq!(reading.distance, Some(42.5));
        assert_eq!(reading.distance_unit.as_deref(), Some("cm"));

        let idle = parse_sensor_data("motion=0 dist 300");
        assert_eq!(idle.motion, Some(false));
        assert_eq!(idle.distance, Some(300.0));
        assert_eq!(idle.distance_unit, None);
    }

    #[test]
    fn negative_temperature_and_pressure() {
        let reading = parse_sensor_data("Temperature=-4.5C Pressure: 1013.25 hPa");
        assert_eq!(reading.temperature, Some(-4.5));
        assert_eq!(reading.pressure, Some(1013.25));
    }

    #[test]
    fn unrelated_text_yields_nothing() {
        assert!(parse_sensor_data("Booting firmware v1.2").is_empty());
        assert!(parse_sensor_data("").is_empty());
    }
}
