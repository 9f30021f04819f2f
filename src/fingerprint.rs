use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// OS-family tally over enumerated usernames.
///
/// The database maps a username to the set of OS labels it was harvested
/// from, one `user;os1;os2;...` line per user. Every inserted username
/// bumps the counter of each label in its set; unknown usernames count
/// nothing.
pub struct Fingerprinting {
    database: BTreeMap<String, BTreeSet<String>>,
    tally: BTreeMap<String, u32>,
}

impl Fingerprinting {
    /// An empty tally with no database loaded
    pub fn new() -> Self {
        Fingerprinting {
            database: BTreeMap::new(),
            tally: BTreeMap::new(),
        }
    }

    /// Loads a semicolon separated database file. Empty OS labels are kept
    /// as empty strings; blank lines are skipped.
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut fingerprinting = Fingerprinting::new();
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim_start();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split(';');
            let user = match tokens.next() {
                Some(user) => user.to_string(),
                None => continue,
            };
            let labels = fingerprinting.database.entry(user).or_default();
            for label in tokens {
                labels.insert(label.to_string());
            }
        }
        Ok(fingerprinting)
    }

    /// Counts one occurrence of every OS label associated with the user
    pub fn insert(&mut self, user: &str) {
        if let Some(labels) = self.database.get(user) {
            for label in labels {
                *self.tally.entry(label.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Whether any username has been counted so far
    pub fn is_empty(&self) -> bool {
        self.tally.is_empty()
    }

    /// The tally sorted by occurrences descending, ties broken by OS label
    /// ascending so the ordering is stable across runs
    pub fn report(&self) -> Vec<(u32, String)> {
        let mut statistics: Vec<(u32, String)> = self
            .tally
            .iter()
            .map(|(label, count)| (*count, label.clone()))
            .collect();
        statistics.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        statistics
    }
}
