//! Model catalog and the pure price function applied at submission.

use thiserror::Error;

use crate::tasks::models::{MediaType, Platform, TaskPayload};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("unknown model `{0}`")]
    UnknownModel(String),
    #[error("model `{model}` is not served by {platform}")]
    PlatformMismatch { model: String, platform: Platform },
    #[error("resolution `{resolution}` is not offered for `{model}`")]
    UnsupportedResolution { model: String, resolution: String },
    #[error("duration {duration}s is outside 1..={max}s for `{model}`")]
    UnsupportedDuration { model: String, duration: u32, max: u32 },
}

/// How a model is billed. Amounts are in credits.
#[derive(Debug, Clone, Copy)]
pub enum PriceRule {
    Flat(i64),
    /// Rate per second keyed by resolution. The first entry is the default resolution.
    PerSecond {
        rates: &'static [(&'static str, i64)],
        default_duration: u32,
        max_duration: u32,
    },
    /// Fixed price per (resolution, duration) pair. The first entry is the default.
    Tiered(&'static [(&'static str, u32, i64)]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredInput {
    Prompt,
    Image,
    Audio,
    Video,
}

impl RequiredInput {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredInput::Prompt => "prompt",
            RequiredInput::Image => "image",
            RequiredInput::Audio => "audio",
            RequiredInput::Video => "video",
        }
    }

    fn present(&self, payload: &TaskPayload) -> bool {
        fn filled(value: &Option<String>) -> bool {
            value.as_deref().map_or(false, |v| !v.trim().is_empty())
        }
        match self {
            RequiredInput::Prompt => filled(&payload.prompt),
            RequiredInput::Image => payload.primary_image().is_some(),
            RequiredInput::Audio => filled(&payload.audio),
            RequiredInput::Video => filled(&payload.video),
        }
    }
}

/// Which failures send a job to its fallback model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTrigger {
    Always,
    /// Only failures the provider reported with this code.
    FailureCode(&'static str),
}

impl FallbackTrigger {
    pub fn matches(&self, failure_code: Option<&str>) -> bool {
        match self {
            FallbackTrigger::Always => true,
            FallbackTrigger::FailureCode(code) => failure_code == Some(*code),
        }
    }
}

/// Parameters forced onto the payload before it is resubmitted to the fallback model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackOverride {
    pub resolution: Option<&'static str>,
    pub duration: Option<u32>,
}

impl FallbackOverride {
    pub fn apply(&self, payload: &TaskPayload) -> TaskPayload {
        let mut merged = payload.clone();
        if let Some(resolution) = self.resolution {
            merged.resolution = Some(resolution.to_string());
        }
        if let Some(duration) = self.duration {
            merged.duration = Some(duration);
        }
        merged
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackSpec {
    pub model: &'static str,
    pub overrides: FallbackOverride,
    pub when: FallbackTrigger,
}

/// key: model-catalog -> public model id to provider routing
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    /// Identifier clients submit.
    pub id: &'static str,
    /// Model name as the provider knows it.
    pub name: &'static str,
    pub platform: Platform,
    pub media_type: MediaType,
    pub pricing: PriceRule,
    pub requires: &'static [RequiredInput],
    /// Model tried once when this one fails for a reason other than a timeout.
    pub fallback: Option<FallbackSpec>,
}

impl ModelSpec {
    /// Checks that every input the model needs is present.
    pub fn validate(&self, payload: &TaskPayload) -> Result<(), String> {
        match self.requires.iter().find(|input| !input.present(payload)) {
            Some(missing) => Err(format!("{} is required for {}", missing.as_str(), self.id)),
            None => Ok(()),
        }
    }
}

const TALKING_HEAD_RATES: &[(&str, i64)] = &[("540p", 60), ("720p", 120)];

pub static MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "flux-schnell",
        name: "black-forest-labs/flux-schnell",
        platform: Platform::Replicate,
        media_type: MediaType::Image,
        pricing: PriceRule::Flat(20),
        requires: &[RequiredInput::Prompt],
        fallback: None,
    },
    ModelSpec {
        id: "minimax-video",
        name: "minimax/video-01-live",
        platform: Platform::Replicate,
        media_type: MediaType::Video,
        pricing: PriceRule::Tiered(&[("768p", 6, 300), ("768p", 10, 500), ("1080p", 6, 500)]),
        requires: &[RequiredInput::Image],
        fallback: Some(FallbackSpec {
            model: "seedance-pro",
            overrides: FallbackOverride {
                resolution: Some("720p"),
                duration: Some(5),
            },
            when: FallbackTrigger::Always,
        }),
    },
    ModelSpec {
        id: "ray-flash-v2v",
        name: "luma/modify-video",
        platform: Platform::Replicate,
        media_type: MediaType::Video,
        pricing: PriceRule::PerSecond {
            rates: &[("720p", 30)],
            default_duration: 5,
            max_duration: 15,
        },
        requires: &[RequiredInput::Video],
        fallback: Some(FallbackSpec {
            model: "ray-flash-modify",
            overrides: FallbackOverride {
                resolution: None,
                duration: None,
            },
            when: FallbackTrigger::Always,
        }),
    },
    ModelSpec {
        id: "seedance-pro",
        name: "doubao-seedance-1-0-pro-250528",
        platform: Platform::Ark,
        media_type: MediaType::Video,
        pricing: PriceRule::PerSecond {
            rates: &[("720p", 40), ("480p", 20), ("1080p", 100)],
            default_duration: 5,
            max_duration: 10,
        },
        requires: &[RequiredInput::Prompt],
        fallback: None,
    },
    ModelSpec {
        id: "act-two",
        name: "act_two",
        platform: Platform::Runway,
        media_type: MediaType::Video,
        pricing: PriceRule::PerSecond {
            rates: &[("720p", 50)],
            default_duration: 5,
            max_duration: 30,
        },
        requires: &[RequiredInput::Image, RequiredInput::Video],
        fallback: None,
    },
    ModelSpec {
        id: "ray-flash-modify",
        name: "ray-flash-2",
        platform: Platform::Luma,
        media_type: MediaType::Video,
        pricing: PriceRule::PerSecond {
            rates: &[("720p", 30)],
            default_duration: 5,
            max_duration: 15,
        },
        requires: &[RequiredInput::Video],
        fallback: None,
    },
    ModelSpec {
        id: "grok-imagine",
        name: "grok-imagine/image-to-video",
        platform: Platform::Kie,
        media_type: MediaType::Video,
        pricing: PriceRule::Tiered(&[("720p", 6, 200), ("720p", 10, 300)]),
        requires: &[RequiredInput::Image],
        fallback: Some(FallbackSpec {
            model: "seedance-pro",
            overrides: FallbackOverride {
                resolution: Some("720p"),
                duration: Some(5),
            },
            when: FallbackTrigger::FailureCode("500"),
        }),
    },
    ModelSpec {
        id: "sora-2",
        name: "sora-2-image-to-video",
        platform: Platform::Kie,
        media_type: MediaType::Video,
        pricing: PriceRule::Tiered(&[("720p", 10, 400), ("720p", 15, 600)]),
        requires: &[RequiredInput::Image, RequiredInput::Prompt],
        fallback: None,
    },
    ModelSpec {
        id: "hedra-character-3",
        name: "d1dd37a3-e39a-4854-a298-6510289f9cf2",
        platform: Platform::Hedra,
        media_type: MediaType::Video,
        pricing: PriceRule::PerSecond {
            rates: TALKING_HEAD_RATES,
            default_duration: 10,
            max_duration: 60,
        },
        requires: &[RequiredInput::Image, RequiredInput::Audio],
        fallback: None,
    },
];

pub fn find_model(id: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|spec| spec.id == id)
}

/// Computes the credit cost of a job. Pure: the same inputs always yield the same price.
pub fn price(
    platform: Platform,
    model: &str,
    resolution: Option<&str>,
    duration: Option<u32>,
) -> Result<i64, PricingError> {
    let spec = find_model(model).ok_or_else(|| PricingError::UnknownModel(model.to_string()))?;
    if spec.platform != platform {
        return Err(PricingError::PlatformMismatch {
            model: model.to_string(),
            platform,
        });
    }
    let unsupported_resolution = |resolution: &str| PricingError::UnsupportedResolution {
        model: model.to_string(),
        resolution: resolution.to_string(),
    };

    match spec.pricing {
        PriceRule::Flat(amount) => Ok(amount),
        PriceRule::PerSecond {
            rates,
            default_duration,
            max_duration,
        } => {
            let rate = match resolution {
                Some(requested) => rates
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(requested))
                    .map(|(_, rate)| *rate)
                    .ok_or_else(|| unsupported_resolution(requested))?,
                None => rates.first().map(|(_, rate)| *rate).unwrap_or_default(),
            };
            let seconds = duration.unwrap_or(default_duration);
            if seconds == 0 || seconds > max_duration {
                return Err(PricingError::UnsupportedDuration {
                    model: model.to_string(),
                    duration: seconds,
                    max: max_duration,
                });
            }
            Ok(rate * i64::from(seconds))
        }
        PriceRule::Tiered(tiers) => {
            let Some((default_resolution, default_duration, _)) = tiers.first() else {
                return Ok(0);
            };
            let requested_resolution = resolution.unwrap_or(*default_resolution);
            let requested_duration = duration.unwrap_or(*default_duration);
            if !tiers
                .iter()
                .any(|(name, _, _)| name.eq_ignore_ascii_case(requested_resolution))
            {
                return Err(unsupported_resolution(requested_resolution));
            }
            tiers
                .iter()
                .find(|(name, seconds, _)| {
                    name.eq_ignore_ascii_case(requested_resolution)
                        && *seconds == requested_duration
                })
                .map(|(_, _, amount)| *amount)
                .ok_or_else(|| PricingError::UnsupportedDuration {
                    model: model.to_string(),
                    duration: requested_duration,
                    max: tiers
                        .iter()
                        .map(|(_, seconds, _)| *seconds)
                        .max()
                        .unwrap_or_default(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn talking_head_charges_per_second_by_resolution() {
        assert_eq!(
            price(Platform::Hedra, "hedra-character-3", Some("540p"), Some(10)),
            Ok(600)
        );
        assert_eq!(
            price(Platform::Hedra, "hedra-character-3", Some("720p"), Some(10)),
            Ok(1200)
        );
        assert_eq!(
            price(Platform::Hedra, "hedra-character-3", None, None),
            Ok(600)
        );
    }

    #[test]
    fn price_is_deterministic() {
        let first = price(Platform::Ark, "seedance-pro", Some("1080p"), Some(7));
        let second = price(Platform::Ark, "seedance-pro", Some("1080p"), Some(7));
        assert_eq!(first, Ok(700));
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_inputs_are_pricing_errors() {
        assert_eq!(
            price(Platform::Replicate, "does-not-exist", None, None),
            Err(PricingError::UnknownModel("does-not-exist".into()))
        );
        assert!(matches!(
            price(Platform::Hedra, "hedra-character-3", Some("4k"), Some(5)),
            Err(PricingError::UnsupportedResolution { .. })
        ));
        assert!(matches!(
            price(Platform::Hedra, "hedra-character-3", Some("720p"), Some(61)),
            Err(PricingError::UnsupportedDuration { .. })
        ));
        assert!(matches!(
            price(Platform::Ark, "hedra-character-3", None, None),
            Err(PricingError::PlatformMismatch { .. })
        ));
    }

    #[test]
    fn tiered_models_only_price_listed_durations() {
        assert_eq!(
            price(Platform::Kie, "grok-imagine", Some("720p"), Some(10)),
            Ok(300)
        );
        assert!(matches!(
            price(Platform::Kie, "grok-imagine", Some("720p"), Some(8)),
            Err(PricingError::UnsupportedDuration { max: 10, .. })
        ));
    }

    #[test]
    fn fallbacks_point_at_catalog_entries() {
        for spec in MODELS {
            if let Some(fallback) = spec.fallback {
                let target = find_model(fallback.model).expect("fallback model listed");
                assert_ne!(target.platform, spec.platform);
                assert_eq!(target.media_type, spec.media_type);
                // Overridden parameters must be priceable by the target.
                let forced = fallback.overrides.apply(&TaskPayload::default());
                assert!(price(
                    target.platform,
                    target.id,
                    forced.resolution.as_deref(),
                    forced.duration
                )
                .is_ok());
            }
        }
    }

    #[test]
    fn fallback_override_replaces_only_forced_fields() {
        let payload = TaskPayload {
            prompt: Some("harbour at dusk".into()),
            resolution: Some("768p".into()),
            duration: Some(10),
            ..TaskPayload::default()
        };
        let fallback = find_model("minimax-video").and_then(|spec| spec.fallback).unwrap();
        let merged = fallback.overrides.apply(&payload);
        assert_eq!(merged.resolution.as_deref(), Some("720p"));
        assert_eq!(merged.duration, Some(5));
        assert_eq!(merged.prompt, payload.prompt);
        assert_eq!(payload.resolution.as_deref(), Some("768p"));
    }

    #[test]
    fn failure_code_trigger_matches_exact_code() {
        let trigger = FallbackTrigger::FailureCode("500");
        assert!(trigger.matches(Some("500")));
        assert!(!trigger.matches(Some("400")));
        assert!(!trigger.matches(None));
        assert!(FallbackTrigger::Always.matches(None));
    }

    #[test]
    fn validate_reports_first_missing_input() {
        let spec = find_model("hedra-character-3").unwrap();
        let payload = TaskPayload {
            image: Some("https://cdn.example/face.png".into()),
            ..TaskPayload::default()
        };
        assert_eq!(
            spec.validate(&payload),
            Err("audio is required for hedra-character-3".to_string())
        );
    }
}
