//! Choosing the next port to probe on a host.
use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

use crate::model::{Host, HostSource};

use super::probe::Probe;

static FTP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ftp\d*[.-]").expect("static pattern"));
static WEB_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:www|web|http)\d*[.-]").expect("static pattern"));
static MAIL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:mail|smtp|mx|imap|pop3?|mta)\d*[.-]").expect("static pattern")
});

/// The port lists the scanner picks from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPlan {
    pub mail: Vec<u16>,
    pub name_server: Vec<u16>,
    pub ftp: Vec<u16>,
    pub web: Vec<u16>,
    /// Tried in random order once no priority port is left.
    pub fallback: Vec<u16>,
    /// Probes used instead of [`Probe::for_port`] on the given ports.
    pub probes: HashMap<u16, Probe>,
}

impl Default for PortPlan {
    fn default() -> Self {
        Self {
            mail: vec![25, 110, 143, 587],
            name_server: vec![53],
            ftp: vec![21],
            web: vec![80, 443, 8000, 8080],
            fallback: vec![
                21, 22, 23, 25, 53, 79, 80, 110, 143, 161, 443, 631, 1024, 2525, 4444, 5353,
                5800, 5900, 8000, 8080, 8081,
            ],
            probes: HashMap::new(),
        }
    }
}

impl PortPlan {
    /// The priority lists that apply to `host`, most specific first.
    fn priorities<'a>(&'a self, host: &Host) -> Vec<&'a [u16]> {
        let mut lists: Vec<&[u16]> = Vec::new();
        match host.source() {
            HostSource::MailExchanger => lists.push(&self.mail),
            HostSource::NameServer => lists.push(&self.name_server),
            _ => {}
        }

        let name = host.name();
        if FTP_NAME.is_match(name) {
            lists.push(&self.ftp);
        }
        if WEB_NAME.is_match(name) {
            lists.push(&self.web);
        }
        if MAIL_NAME.is_match(name) {
            lists.push(&self.mail);
        }
        lists
    }

    /// How `port` is probed.
    pub fn probe_for(&self, port: u16) -> Probe {
        self.probes
            .get(&port)
            .copied()
            .unwrap_or_else(|| Probe::for_port(port))
    }

    /// Every port this plan could ever pick.
    pub fn universe(&self) -> Vec<u16> {
        self.fallback
            .iter()
            .chain(&self.mail)
            .chain(&self.name_server)
            .chain(&self.ftp)
            .chain(&self.web)
            .copied()
            .unique()
            .collect()
    }
}

/// Picks the next port to probe on `host`, never one in `known`.
///
/// Priority lists derived from the host's source and name are tried in
/// order. After that, the whole port universe in random order. `None` means
/// every port has been probed already, the host is skipped this round.
pub fn pick_port<R: Rng + ?Sized>(
    host: &Host,
    known: &HashSet<u16>,
    plan: &PortPlan,
    rng: &mut R,
) -> Option<u16> {
    if let Some(port) = plan
        .priorities(host)
        .into_iter()
        .flatten()
        .copied()
        .find(|port| !known.contains(port))
    {
        return Some(port);
    }

    let mut universe = plan.universe();
    universe.shuffle(rng);
    universe.into_iter().find(|port| !known.contains(port))
}
