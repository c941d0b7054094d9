use std::path::Path;

use log::debug;

use super::{CacheGeometry, GeometryError, Vendor};

const CACHE_DIR: &str = "/sys/devices/system/cpu/cpu0/cache";

/// Parses sysfs sizes such as `8192K` or `1M`.
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (num, mult) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 1 << 10),
        'M' => (&s[..s.len() - 1], 1 << 20),
        'G' => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    num.parse::<usize>().ok().map(|n| n * mult)
}

/// Builds a geometry from one sysfs cache `index*` directory.
///
/// `read` returns the content of the named attribute file.
pub(super) fn from_attributes(
    read: impl Fn(&str) -> Option<String>,
    vendor: Vendor,
    slices: usize,
) -> Option<CacheGeometry> {
    let num = |name: &str| read(name).and_then(|v| v.trim().parse::<usize>().ok());
    let level = num("level")? as u8;
    let line_size = num("coherency_line_size")?;
    let ways = num("ways_of_associativity")?;
    let partitions = num("physical_line_partition").unwrap_or(1).max(1);
    let size = read("size").and_then(|s| parse_size(&s)).unwrap_or(0);
    let mut sets = num("number_of_sets").unwrap_or(0);
    if sets == 0 && line_size > 0 && ways > 0 {
        sets = size / line_size / ways / partitions;
    }
    Some(CacheGeometry {
        vendor,
        level,
        line_size,
        sets,
        ways,
        partitions,
        slices,
        size,
    })
}

/// Reads the highest data or unified cache level from sysfs.
pub(super) fn detect(vendor: Vendor, slices: usize) -> Result<CacheGeometry, GeometryError> {
    let entries = std::fs::read_dir(CACHE_DIR)?;
    let mut best: Option<CacheGeometry> = None;
    for entry in entries {
        let path = entry?.path();
        if !path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("index"))
        {
            continue;
        }
        let read = |name: &str| std::fs::read_to_string(Path::new(&path).join(name)).ok();
        if read("type").is_some_and(|t| t.trim() == "Instruction") {
            continue;
        }
        if let Some(geometry) = from_attributes(read, vendor, slices) {
            debug!("sysfs {}: {:?}", path.display(), geometry);
            if best.is_none_or(|b| geometry.level > b.level) {
                best = Some(geometry);
            }
        }
    }
    best.ok_or(GeometryError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8192K\n"), Some(8 << 20));
        assert_eq!(parse_size("1M"), Some(1 << 20));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("K"), None);
    }

    #[test]
    fn test_sets_derived_from_size() {
        let attrs: HashMap<&str, &str> = HashMap::from([
            ("level", "3"),
            ("coherency_line_size", "64"),
            ("ways_of_associativity", "16"),
            ("physical_line_partition", "1"),
            ("size", "16384K"),
            ("number_of_sets", "0"),
        ]);
        let g = from_attributes(|n| attrs.get(n).map(|v| v.to_string()), Vendor::Intel, 8)
            .expect("valid attributes");
        assert_eq!(g.sets, 16384);
        assert_eq!(g.slices, 8);
        assert_eq!(g.level, 3);
    }

    #[test]
    fn test_missing_attribute() {
        let attrs: HashMap<&str, &str> = HashMap::from([("level", "2")]);
        assert!(from_attributes(|n| attrs.get(n).map(|v| v.to_string()), Vendor::Amd, 1).is_none());
    }
}
