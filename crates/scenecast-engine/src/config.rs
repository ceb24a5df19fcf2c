use std::env;

pub const DEFAULT_API_BASE: &str = "https://dashscope-intl.aliyuncs.com/api/v1";
pub const DEFAULT_TEXT_MODEL: &str = "qwen-plus";
pub const DEFAULT_IMAGE_MODEL: &str = "wan2.2-t2i-flash";
pub const DEFAULT_IMAGE_SIZE: &str = "1024*1024";
pub const DEFAULT_SCENE_LOCALE: &str = "成都";

#[derive(Debug, Clone, PartialEq)]
pub struct RewriteSettings {
    pub model: String,
    /// Place every rewritten scene is anchored to.
    pub locale: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_TEXT_MODEL.to_string(),
            locale: DEFAULT_SCENE_LOCALE.to_string(),
            max_tokens: 200,
            temperature: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJobSettings {
    pub model: String,
    pub size: String,
    pub count: u32,
}

impl Default for ImageJobSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_IMAGE_MODEL.to_string(),
            size: DEFAULT_IMAGE_SIZE.to_string(),
            count: 1,
        }
    }
}

/// Poll timing, whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval_seconds: u64,
    pub slow_notice_after_seconds: u64,
    pub max_wait_seconds: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 4,
            slow_notice_after_seconds: 30,
            max_wait_seconds: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub rewrite: RewriteSettings,
    pub image: ImageJobSettings,
    pub poll: PollSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            rewrite: RewriteSettings::default(),
            image: ImageJobSettings::default(),
            poll: PollSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = PollSettings::default();
        Self {
            api_key: read("DASHSCOPE_API_KEY"),
            api_base: read("DASHSCOPE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            rewrite: RewriteSettings {
                model: read("SCENECAST_TEXT_MODEL")
                    .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
                locale: read("SCENECAST_SCENE_LOCALE")
                    .unwrap_or_else(|| DEFAULT_SCENE_LOCALE.to_string()),
                ..RewriteSettings::default()
            },
            image: ImageJobSettings {
                model: read("SCENECAST_IMAGE_MODEL")
                    .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
                size: read("SCENECAST_IMAGE_SIZE")
                    .unwrap_or_else(|| DEFAULT_IMAGE_SIZE.to_string()),
                count: 1,
            },
            poll: PollSettings {
                interval_seconds: seconds_value(
                    read("SCENECAST_POLL_INTERVAL"),
                    defaults.interval_seconds,
                    1,
                    30,
                ),
                slow_notice_after_seconds: seconds_value(
                    read("SCENECAST_SLOW_NOTICE_AFTER"),
                    defaults.slow_notice_after_seconds,
                    0,
                    600,
                ),
                max_wait_seconds: seconds_value(
                    read("SCENECAST_MAX_WAIT"),
                    defaults.max_wait_seconds,
                    10,
                    1800,
                ),
            },
        }
    }
}

pub fn seconds_value(raw: Option<String>, default: u64, min: u64, max: u64) -> u64 {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config, EngineConfig::default());
        assert!(config.api_key.is_none());
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.rewrite, RewriteSettings::default());
        assert_eq!(config.image, ImageJobSettings::default());
        assert_eq!(config.poll, PollSettings::default());
        assert_eq!(config.rewrite.max_tokens, 200);
        assert_eq!(config.image.count, 1);
    }

    #[test]
    fn environment_overrides_are_trimmed_and_clamped() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DASHSCOPE_API_KEY", "  sk-test "),
            ("DASHSCOPE_API_BASE", "https://dashscope.aliyuncs.com/api/v1/"),
            ("SCENECAST_IMAGE_MODEL", "wanx-v1"),
            ("SCENECAST_SCENE_LOCALE", "重庆"),
            ("SCENECAST_POLL_INTERVAL", "0"),
            ("SCENECAST_MAX_WAIT", "99999"),
            ("SCENECAST_SLOW_NOTICE_AFTER", "not-a-number"),
            ("SCENECAST_TEXT_MODEL", "   "),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.api_base, "https://dashscope.aliyuncs.com/api/v1");
        assert_eq!(config.image.model, "wanx-v1");
        assert_eq!(config.rewrite.locale, "重庆");
        assert_eq!(config.rewrite.model, DEFAULT_TEXT_MODEL);
        assert_eq!(config.poll.interval_seconds, 1);
        assert_eq!(config.poll.max_wait_seconds, 1800);
        assert_eq!(config.poll.slow_notice_after_seconds, 30);
    }
}
