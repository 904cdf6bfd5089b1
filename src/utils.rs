pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(&x, &y)| x == y).count()
}

#[derive(Display, PartialEq, Eq)]
#[display("{:?}", self)]
/// Outputs bytes as escaped ascii strings
pub struct EscapedBytes<'a>(pub &'a [u8]);

impl std::fmt::Debug for EscapedBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut end_zeroes = 0;
        if cfg!(any(fuzzing, test)) {
            end_zeroes = self.0.iter().rev().take_while(|b| **b == 0).count();
            if end_zeroes <= 5 {
                end_zeroes = 0;
            }
        }
        for &b in &self.0[..self.0.len() - end_zeroes] {
            write!(f, "{}", std::ascii::escape_default(b))?
        }
        if end_zeroes != 0 {
            write!(f, "…\\0*{end_zeroes}")?;
        }
        Ok(())
    }
}

#[derive(Display)]
#[display("{:?}", self)]
/// Outputs bytes sizes as human sizes
pub struct ByteSize(pub u64);

impl std::fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const KB: u64 = 1024;
        const MB: u64 = 1024 * 1024;
        const GB: u64 = 1024 * 1024 * 1024;
        let (value, suffix) = match self.0 {
            v @ 0..KB => (v as f64, "B"),
            v @ KB..MB => (v as f64 / KB as f64, "KB"),
            v @ MB..GB => (v as f64 / MB as f64, "MB"),
            v @ GB.. => (v as f64 / GB as f64, "GB"),
        };
        write!(f, "{value:.3}{suffix}")
    }
}

/// Joins bytes as `1-2-3-`, the format used by the tree dumps.
pub fn dash_joined(bytes: impl IntoIterator<Item = u8>) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for b in bytes {
        let _ = write!(out, "{b}-");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(b"abc", b"abd"), 2);
        assert_eq!(common_prefix_len(b"abc", b"ab"), 2);
        assert_eq!(common_prefix_len(b"", b"ab"), 0);
        assert_eq!(common_prefix_len(b"xyz", b"xyz"), 3);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(EscapedBytes(b"a\x00b").to_string(), "a\\x00b");
        assert_eq!(ByteSize(2048).to_string(), "2.000KB");
        assert_eq!(dash_joined([1, 2, 255]), "1-2-255-");
    }
}
