//! Formatting helpers for log output.

/// A pretty-printer wrapper for a size in bytes.
///
/// Rounds to the nearest macro unit so large block sizes are easy to read in
/// allocation logs.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PrettySize(pub u64);

const UNIT_NAMES: [&str; 5] = ["b", "kb", "mb", "gb", "tb"];

impl std::fmt::Debug for PrettySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("0 b");
        }
        let size = self.0 as f64;
        let unit_pow = size.log(1024.0).clamp(0.0, 4.0).floor();
        let size_in_units = size / 1024.0_f64.powf(unit_pow);
        let unit_name = UNIT_NAMES[unit_pow as usize];
        if size_in_units.fract() == 0.0 {
            write!(f, "{size_in_units} {unit_name}")
        } else {
            write!(f, "{size_in_units:.2} {unit_name}")
        }
    }
}

impl std::fmt::Display for PrettySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_units() {
        assert_eq!(PrettySize(0).to_string(), "0 b");
        assert_eq!(PrettySize(512).to_string(), "512 b");
        assert_eq!(PrettySize(64 * 1024).to_string(), "64 kb");
        assert_eq!(PrettySize(3 * 1024 * 1024).to_string(), "3 mb");
        assert_eq!(PrettySize(1536).to_string(), "1.50 kb");
    }
}
