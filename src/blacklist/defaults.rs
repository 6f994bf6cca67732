// Seed lists for the blacklists. Hosts matching these are either not ours to
// poke at or so plentiful (dial-up pools, customer ranges) that they would
// drown everything else.

/// Patterns matched against reverse-resolved and transferred host names.
pub const DEFAULT_NAME_PATTERNS: &[&str] = &[
    r"(?i)^localhost(\.|$)",
    r"(?i)\.(localdomain|local|lan|home|internal|invalid|test)\.?$",
    r"(?i)\.(in-addr|ip6)\.arpa\.?$",
    r"(?i)\d{1,3}[-._]\d{1,3}[-._]\d{1,3}[-._]\d{1,3}",
    r"(?i)\b(a|v|x)?dsl\b",
    r"(?i)\b(dial-?up|dialin|ppp|pppoe|isdn)\b",
    r"(?i)\b(dyn|dynamic|dynip|dhcp|pool|cable|broadband|bb)\b",
    r"(?i)(^|[-.])customers?[-.]",
    r"(?i)(^|[-.])(client|user|subscriber|residential)s?[-.]",
    r"(?i)\b(unassigned|unknown|not-?set|no-?reverse)\b",
    r"(?i)(^|\.)(mobile|wireless|wlan|3g|4g|lte|5g)[-.]",
];

/// Networks matched against generated and transferred addresses.
pub const DEFAULT_ADDRESS_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "64:ff9b::/96",
    "100::/64",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];
