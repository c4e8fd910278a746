//! Graphite plaintext line encoding: `<name> <value> <timestamp>\n`.

use std::io::Write;

use crate::metric::MetricPoint;

/// Encodes points, prefixing names with an optional namespace.
#[derive(Debug, Clone, Default)]
pub struct PlaintextEncoder {
    prefix: Option<String>,
}

impl PlaintextEncoder {
    /// An empty namespace means no prefix. Surrounding dots are ignored.
    pub fn new(namespace: &str) -> Self {
        let ns = namespace.trim_matches('.');
        Self {
            prefix: (!ns.is_empty()).then(|| format!("{ns}.")),
        }
    }

    /// Appends one line for `point` to `out`.
    pub fn encode_into(&self, point: &MetricPoint, out: &mut Vec<u8>) {
        if let Some(prefix) = &self.prefix {
            out.extend_from_slice(prefix.as_bytes());
        }
        // Writing into a Vec cannot fail.
        let _ = writeln!(out, "{point}");
    }

    /// Appends one line per point, in order. Returns the number encoded.
    pub fn encode_batch<'a>(
        &self,
        points: impl IntoIterator<Item = &'a MetricPoint>,
        out: &mut Vec<u8>,
    ) -> usize {
        let mut n = 0;
        for point in points {
            self.encode_into(point, out);
            n += 1;
        }
        n
    }

    pub fn encode_line(&self, point: &MetricPoint) -> String {
        let mut out = Vec::with_capacity(64);
        self.encode_into(point, &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_without_namespace() {
        let enc = PlaintextEncoder::new("");
        let p = MetricPoint::new("queue.ack.drops", 4.0, 1_700_000_000);
        assert_eq!(enc.encode_line(&p), "queue.ack.drops 4 1700000000\n");
    }

    #[test]
    fn test_line_with_namespace() {
        let enc = PlaintextEncoder::new("pf.");
        let p = MetricPoint::new("icmp.10.0.0.1.loss", 0.0, 5);
        assert_eq!(enc.encode_line(&p), "pf.icmp.10.0.0.1.loss 0 5\n");
    }

    #[test]
    fn test_batch_preserves_order() {
        let enc = PlaintextEncoder::new("ns");
        let points = [
            MetricPoint::new("a", 1.0, 1),
            MetricPoint::new("b", 2.5, 1),
        ];
        let mut out = Vec::new();
        assert_eq!(enc.encode_batch(&points, &mut out), 2);
        assert_eq!(String::from_utf8(out).expect("utf8"), "ns.a 1 1\nns.b 2.5 1\n");
    }
}
