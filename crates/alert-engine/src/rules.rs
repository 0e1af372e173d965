use journal_store::{Alert, AlertKind};
use market_core::{Symbol, Tick};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("{0} alert has no threshold_value")]
    MissingThreshold(AlertKind),
}

/// Typed form of one alert's trigger condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlertRule {
    PriceAbove { threshold: f64 },
    PriceBelow { threshold: f64 },
    VolumeSpike { threshold: f64 },
    SentimentChange { threshold: f64 },
}

/// A rule that fired against a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    /// The tick field that satisfied the rule.
    pub trigger_value: f64,
    pub message: String,
}

impl AlertRule {
    pub fn from_alert(alert: &Alert) -> Result<Self, RuleError> {
        let threshold = alert
            .threshold_value
            .ok_or(RuleError::MissingThreshold(alert.alert_type))?;
        Ok(match alert.alert_type {
            AlertKind::PriceAbove => Self::PriceAbove { threshold },
            AlertKind::PriceBelow => Self::PriceBelow { threshold },
            AlertKind::VolumeSpike => Self::VolumeSpike { threshold },
            AlertKind::SentimentChange => Self::SentimentChange { threshold },
        })
    }

    pub fn kind(&self) -> AlertKind {
        match self {
            Self::PriceAbove { .. } => AlertKind::PriceAbove,
            Self::PriceBelow { .. } => AlertKind::PriceBelow,
            Self::VolumeSpike { .. } => AlertKind::VolumeSpike,
            Self::SentimentChange { .. } => AlertKind::SentimentChange,
        }
    }

    /// Apply the rule. A tick missing the field the rule reads never fires.
    pub fn evaluate(&self, tick: &Tick) -> Option<Firing> {
        let s = &tick.symbol;
        match *self {
            Self::PriceAbove { threshold } => (tick.price >= threshold).then(|| Firing {
                trigger_value: tick.price,
                message: price_message(s, "above", threshold, tick.price),
            }),
            Self::PriceBelow { threshold } => (tick.price <= threshold).then(|| Firing {
                trigger_value: tick.price,
                message: price_message(s, "below", threshold, tick.price),
            }),
            Self::VolumeSpike { threshold } => {
                let volume = tick.volume?;
                (volume >= threshold).then(|| Firing {
                    trigger_value: volume,
                    message: format!(
                        "{} volume spike detected. Volume: {}, Threshold: {}",
                        s,
                        number(volume),
                        number(threshold)
                    ),
                })
            }
            Self::SentimentChange { threshold } => {
                let score = tick.sentiment_score?;
                (score.abs() >= threshold).then(|| Firing {
                    trigger_value: score,
                    message: format!(
                        "{} sentiment change detected. Sentiment Score: {}, Threshold: {}",
                        s,
                        number(score),
                        number(threshold)
                    ),
                })
            }
        }
    }
}

fn price_message(symbol: &Symbol, direction: &str, threshold: f64, price: f64) -> String {
    format!(
        "{} price is {} {}. Current: {}",
        symbol,
        direction,
        number(threshold),
        number(price)
    )
}

/// Whole numbers keep one decimal place (`150.0`), everything else prints
/// in shortest form (`149.5`). Very large and very small magnitudes use a
/// signed two-digit exponent (`1e+16`, `1.5e-05`).
fn number(value: f64) -> String {
    let magnitude = value.abs();
    if value.is_finite() && value != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let sci = format!("{:e}", value);
        if let Some((mantissa, exp)) = sci.split_once('e') {
            if let Ok(exp) = exp.parse::<i32>() {
                let sign = if exp < 0 { '-' } else { '+' };
                return format!("{}e{}{:02}", mantissa, sign, exp.abs());
            }
        }
        sci
    } else if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn alert(kind: AlertKind, threshold: Option<f64>) -> Alert {
        Alert {
            id: 1,
            user_id: 1,
            symbol: sym("AAPL"),
            alert_type: kind,
            threshold_value: threshold,
            condition: None,
            is_active: true,
            message: None,
            created_at: Utc::now(),
            triggered_at: None,
        }
    }

    #[test]
    fn test_price_above_boundaries() {
        let rule = AlertRule::PriceAbove { threshold: 100.0 };
        assert!(rule.evaluate(&Tick::new(sym("AAPL"), 99.99)).is_none());
        assert!(rule.evaluate(&Tick::new(sym("AAPL"), 100.0)).is_some());
        assert!(rule.evaluate(&Tick::new(sym("AAPL"), 100.01)).is_some());
    }

    #[test]
    fn test_price_below_boundaries() {
        let rule = AlertRule::PriceBelow { threshold: 100.0 };
        assert!(rule.evaluate(&Tick::new(sym("AAPL"), 99.99)).is_some());
        assert!(rule.evaluate(&Tick::new(sym("AAPL"), 100.0)).is_some());
        assert!(rule.evaluate(&Tick::new(sym("AAPL"), 100.01)).is_none());
    }

    #[test]
    fn test_volume_spike_needs_volume() {
        let rule = AlertRule::VolumeSpike { threshold: 1000.0 };
        let no_volume = Tick::new(sym("AAPL"), 10_000.0);
        assert!(rule.evaluate(&no_volume).is_none());

        let firing = rule.evaluate(&no_volume.with_volume(1500.0)).unwrap();
        assert_eq!(firing.trigger_value, 1500.0);
        assert_eq!(
            firing.message,
            "AAPL volume spike detected. Volume: 1500.0, Threshold: 1000.0"
        );
    }

    #[test]
    fn test_sentiment_uses_magnitude() {
        let rule = AlertRule::SentimentChange { threshold: 0.5 };
        let tick = Tick::new(sym("AAPL"), 150.0);
        assert!(rule.evaluate(&tick).is_none());
        assert!(rule.evaluate(&tick.clone().with_sentiment(0.3)).is_none());

        let firing = rule.evaluate(&tick.with_sentiment(-0.62)).unwrap();
        assert_eq!(
            firing.message,
            "AAPL sentiment change detected. Sentiment Score: -0.62, Threshold: 0.5"
        );
    }

    #[test]
    fn test_number_exponent_form() {
        assert_eq!(number(150.0), "150.0");
        assert_eq!(number(149.5), "149.5");
        assert_eq!(number(0.0), "0.0");
        assert_eq!(number(1e16), "1e+16");
        assert_eq!(number(1.5e17), "1.5e+17");
        assert_eq!(number(-2e20), "-2e+20");
        assert_eq!(number(0.00001), "1e-05");
        assert_eq!(number(0.0001), "0.0001");
    }

    #[test]
    fn test_price_message_format() {
        let rule = AlertRule::PriceBelow { threshold: 150.0 };
        let firing = rule.evaluate(&Tick::new(sym("AAPL"), 149.5)).unwrap();
        assert_eq!(firing.message, "AAPL price is below 150.0. Current: 149.5");
    }

    #[test]
    fn test_from_alert() {
        let rule = AlertRule::from_alert(&alert(AlertKind::VolumeSpike, Some(5.0))).unwrap();
        assert_eq!(rule.kind(), AlertKind::VolumeSpike);
        assert_eq!(
            AlertRule::from_alert(&alert(AlertKind::PriceAbove, None)),
            Err(RuleError::MissingThreshold(AlertKind::PriceAbove))
        );
    }
}
