use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{info, warn};

/// Code returned for addresses no table prefix covers.
pub const UNKNOWN_ASN: &str = "ZZ";

/// Precomputed IP-prefix -> ASN mapping, loaded once per run and read-only
/// afterwards. The table file is a JSON object of CIDR prefix to ASN code,
/// e.g. `{"192.0.2.0/24": "AS64496"}`.
pub struct AsnTable {
    /// Prefix maps keyed by masked network address, longest prefix first.
    by_length: Vec<(u8, HashMap<u32, String>)>,
}

impl AsnTable {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open ASN table {:?}", path))?;
        let raw: HashMap<String, String> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse ASN table {:?}", path))?;

        let mut grouped: HashMap<u8, HashMap<u32, String>> = HashMap::new();
        let mut invalid = 0u64;
        for (cidr, asn) in raw {
            match parse_cidr(&cidr) {
                Some((network, bits)) => {
                    grouped.entry(bits).or_default().insert(network, asn);
                }
                None => {
                    invalid += 1;
                    warn!(component = "asn_table", entry = %cidr, "Skipping malformed table entry");
                }
            }
        }

        let mut by_length: Vec<(u8, HashMap<u32, String>)> = grouped.into_iter().collect();
        by_length.sort_by(|a, b| b.0.cmp(&a.0));

        let entries: usize = by_length.iter().map(|(_, m)| m.len()).sum();
        info!(
            component = "asn_table",
            entries,
            invalid,
            prefix_lengths = by_length.len(),
            "ASN table loaded"
        );
        Ok(Self { by_length })
    }

    /// Longest-prefix match. Unparseable or uncovered addresses map to [`UNKNOWN_ASN`].
    pub fn lookup(&self, ip: &str) -> &str {
        match ip.parse::<Ipv4Addr>() {
            Ok(addr) => self.lookup_addr(addr),
            Err(_) => UNKNOWN_ASN,
        }
    }

    pub fn lookup_addr(&self, addr: Ipv4Addr) -> &str {
        let raw = u32::from(addr);
        for (bits, map) in &self.by_length {
            if let Some(asn) = map.get(&mask(raw, *bits)) {
                return asn;
            }
        }
        UNKNOWN_ASN
    }

    /// Coarsened network key for an address, e.g. `prefix("10.1.2.3", 24)`
    /// gives `"10.1.2.0/24"`. `None` for anything that is not an IPv4 address.
    pub fn prefix(&self, ip: &str, bits: u8) -> Option<String> {
        let addr = ip.parse::<Ipv4Addr>().ok()?;
        let network = Ipv4Addr::from(mask(u32::from(addr), bits));
        Some(format!("{}/{}", network, bits))
    }
}

fn parse_cidr(cidr: &str) -> Option<(u32, u8)> {
    let (ip, bits) = cidr.split_once('/')?;
    let addr = ip.parse::<Ipv4Addr>().ok()?;
    let bits = bits.parse::<u8>().ok()?;
    if bits == 0 || bits > 32 {
        return None;
    }
    Some((mask(u32::from(addr), bits), bits))
}

fn mask(raw: u32, bits: u8) -> u32 {
    if bits >= 32 {
        raw
    } else {
        raw & !(u32::MAX >> bits)
    }
}
