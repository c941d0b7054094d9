use serde::{Deserialize, Serialize};

/// Memory size representation supporting common units.
///
/// All units use binary (base-2) multipliers (1 KB = 1024 bytes).
///
/// # Examples
///
/// ```
/// use sieve_core::util::Size;
///
/// let pool = Size::MB(800);
/// assert_eq!(pool.bytes(), 800 * 1024 * 1024);
///
/// let window = Size::KB(400);
/// assert_eq!(window.bytes(), 100 * 4096);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in gigabytes (1 GB = 1024 MB)
    GB(usize),
}

impl Size {
    /// Converts this size to bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => *kb * (1 << 10),
            Size::MB(mb) => *mb * (1 << 20),
            Size::GB(gb) => *gb * (1 << 30),
        }
    }

    /// Number of `unit`-sized chunks that fit in this size.
    pub const fn chunks(&self, unit: usize) -> usize {
        self.bytes() / unit
    }
}

impl std::str::FromStr for Size {
    type Err = String;

    /// Parses sizes such as `800MB`, `64 KB`, `1GB` or plain byte counts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let num: usize = num
            .parse()
            .map_err(|e| format!("invalid size '{}': {}", s, e))?;
        match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => Ok(Size::B(num)),
            "K" | "KB" => Ok(Size::KB(num)),
            "M" | "MB" => Ok(Size::MB(num)),
            "G" | "GB" => Ok(Size::GB(num)),
            other => Err(format!("invalid size unit '{}'", other)),
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::B(bytes) => write!(f, "{} B", bytes),
            Size::KB(kb) => write!(f, "{} KB", kb),
            Size::MB(mb) => write!(f, "{} MB", mb),
            Size::GB(gb) => write!(f, "{} GB", gb),
        }
    }
}
