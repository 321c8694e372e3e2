//! Capture and report statistics for dumps and loads

use std::{fmt::Display, time::Duration};

use indexmap::IndexMap;

#[derive(Default, Debug, Clone)]
pub struct Timings {
    timings: IndexMap<String, Duration>,
}

impl Timings {
    pub fn record<T: AsRef<str>>(&mut self, name: T, elapsed: Duration) {
        self.timings.insert(name.as_ref().to_string(), elapsed);
    }

    pub fn get(&self, name: &str) -> Option<Duration> {
        self.timings.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }
}

impl Display for Timings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = self.timings.keys().map(|k| k.len()).max().unwrap_or(0) + 1;

        for (k, v) in &self.timings {
            writeln!(f, "{:width$}: {:14.9}s", k, v.as_secs_f64(), width = width)?;
        }
        Ok(())
    }
}

/// Counts by name, in first-seen order
#[derive(Default, Debug, Clone)]
pub struct Counts {
    counts: IndexMap<&'static str, usize>,
}

impl Counts {
    pub fn bump(&mut self, name: &'static str) {
        *self.counts.entry(name).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }
}

impl Display for Counts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = self.counts.keys().map(|k| k.len()).max().unwrap_or(0) + 1;
        for (k, v) in &self.counts {
            writeln!(f, "{:width$}: {:10}", k, v, width = width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_timings_display_aligned() {
        let mut t = Timings::default();
        t.record("walk", Duration::from_millis(5));
        t.record("resolve-fixups", Duration::from_millis(1));
        let text = format!("{t}");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].find(':'), lines[1].find(':'));
    }

    #[test]
    pub fn test_empty_timings_display() {
        assert_eq!(format!("{}", Timings::default()), "");
    }

    #[test]
    pub fn test_counts() {
        let mut c = Counts::default();
        c.bump("cons");
        c.bump("cons");
        c.bump("string");
        assert_eq!(c.get("cons"), 2);
        assert_eq!(c.get("float"), 0);
        assert_eq!(c.total(), 3);
        assert_eq!(c.iter().next(), Some(("cons", 2)));
    }
}
