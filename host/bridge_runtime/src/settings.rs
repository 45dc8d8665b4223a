use std::time::Duration;

pub const DEFAULT_SID: &str = "S1";
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub sid: String,
    pub stop_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            sid: DEFAULT_SID.to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl HostSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            sid: lookup("WIDGETSYNC_SID")
                .filter(|sid| !sid.is_empty())
                .unwrap_or(defaults.sid),
            stop_timeout: parse_millis(&lookup, "WIDGETSYNC_STOP_TIMEOUT_MS")
                .unwrap_or(defaults.stop_timeout),
            tick_interval: parse_millis(&lookup, "WIDGETSYNC_TICK_MS")
                .unwrap_or(defaults.tick_interval),
        }
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| env.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(HostSettings::from_lookup(|_| None), HostSettings::default());
    }

    #[test]
    fn reads_overrides() {
        let settings = HostSettings::from_lookup(lookup_from(&[
            ("WIDGETSYNC_SID", "S9"),
            ("WIDGETSYNC_STOP_TIMEOUT_MS", "750"),
            ("WIDGETSYNC_TICK_MS", " 10 "),
        ]));

        assert_eq!(settings.sid, "S9");
        assert_eq!(settings.stop_timeout, Duration::from_millis(750));
        assert_eq!(settings.tick_interval, Duration::from_millis(10));
    }

    #[test]
    fn zero_and_garbage_fall_back_to_defaults() {
        let settings = HostSettings::from_lookup(lookup_from(&[
            ("WIDGETSYNC_SID", ""),
            ("WIDGETSYNC_STOP_TIMEOUT_MS", "0"),
            ("WIDGETSYNC_TICK_MS", "soon"),
        ]));

        assert_eq!(settings, HostSettings::default());
    }
}
