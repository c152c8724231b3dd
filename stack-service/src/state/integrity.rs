// Integrity
// Canonical encodings behind event digests, run digests and plan hashes

use super::models::RunPlan;
use crate::execution::events::{format_ts, RunEvent};

use sha2::{Digest, Sha256};

const EVENT_DOMAIN: &str = "ktl.stack-event.v1";
const RUN_DIGEST_DOMAIN: &str = "ktl.stack-run-digest.v1";

/// Feeds NUL-terminated fields to SHA-256 and CRC32 in lockstep
struct CanonicalWriter {
    sha: Sha256,
    crc: crc32fast::Hasher,
}

impl CanonicalWriter {
    fn new() -> Self {
        Self {
            sha: Sha256::new(),
            crc: crc32fast::Hasher::new(),
        }
    }

    fn field(&mut self, value: &str) {
        self.sha.update(value.as_bytes());
        self.sha.update([0u8]);
        self.crc.update(value.as_bytes());
        self.crc.update(&[0u8]);
    }

    fn finish(self) -> (String, String) {
        (
            format!("sha256:{}", hex::encode(self.sha.finalize())),
            format!("crc32:{:08x}", self.crc.finalize()),
        )
    }
}

/// Digest and CRC of an event, chained on its `prev_digest`
///
/// Text fields are trimmed before hashing so that values read back from the
/// database verify identically to the values written.
pub fn compute_event_integrity(ev: &RunEvent) -> (String, String) {
    let mut w = CanonicalWriter::new();
    w.field(EVENT_DOMAIN);
    w.field(&format!("seq={}", ev.seq));
    w.field(&format_ts(ev.ts_ns));
    w.field(ev.run_id.trim());
    w.field(ev.node_id.trim());
    w.field(ev.event_type.as_str());
    w.field(&format!("attempt={}", ev.attempt));
    w.field(ev.message.trim());
    match &ev.error {
        Some(err) => {
            w.field(err.class.trim());
            w.field(err.message.trim());
            w.field(err.digest.trim());
        }
        None => {
            w.field("");
            w.field("");
            w.field("");
        }
    }
    w.field(ev.prev_digest.trim());
    w.finish()
}

/// Binds plan, outcome and event history into one digest
pub fn compute_run_digest(plan_json: &str, summary_json: &str, last_event_digest: &str) -> String {
    let mut w = CanonicalWriter::new();
    w.field(RUN_DIGEST_DOMAIN);
    w.field(plan_json);
    w.field(summary_json);
    w.field(last_event_digest.trim());
    w.finish().0
}

/// SHA-256 over the plan JSON with `planHash` blanked
pub fn compute_plan_hash(plan: &RunPlan) -> Result<String, serde_json::Error> {
    let mut clone = plan.clone();
    clone.plan_hash.clear();
    let raw = serde_json::to_vec(&clone)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&raw))))
}

/// Walk a run's events in Seq order and check the chain
pub fn verify_chain<'a>(events: impl IntoIterator<Item = &'a RunEvent>) -> Result<(), String> {
    let mut prev = String::new();
    for ev in events {
        if ev.prev_digest.trim() != prev {
            return Err(format!(
                "event seq={} prevDigest mismatch (want {:?} got {:?})",
                ev.seq, prev, ev.prev_digest
            ));
        }
        let (digest, crc) = compute_event_integrity(ev);
        if ev.digest.trim() != digest {
            return Err(format!(
                "event seq={} digest mismatch (want {:?} got {:?})",
                ev.seq, digest, ev.digest
            ));
        }
        if ev.crc32.trim() != crc {
            return Err(format!(
                "event seq={} crc32 mismatch (want {:?} got {:?})",
                ev.seq, crc, ev.crc32
            ));
        }
        prev = digest;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::{EventType, RunError};
    use crate::stack::ResolvedRelease;
    use pretty_assertions::assert_eq;

    fn chain(n: usize) -> Vec<RunEvent> {
        let mut out = Vec::new();
        let mut prev = String::new();
        for i in 0..n {
            let mut ev = RunEvent::new("run-1", "c/ns/a", EventType::NodeRunning)
                .with_message(format!("event {}", i));
            ev.seq = i as u64 + 1;
            ev.ts_ns = 1_700_000_000_000_000_000 + i as i64;
            ev.prev_digest = prev.clone();
            let (d, c) = compute_event_integrity(&ev);
            ev.digest = d.clone();
            ev.crc32 = c;
            prev = d;
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_chain_verifies() {
        let events = chain(5);
        assert!(verify_chain(&events).is_ok());
        assert_eq!(events[0].prev_digest, "");
        assert_eq!(events[3].prev_digest, events[2].digest);
        assert!(events[0].crc32.starts_with("crc32:"));
        assert_eq!(events[0].crc32.len(), "crc32:".len() + 8);
    }

    #[test]
    fn test_tampering_breaks_chain() {
        let mut events = chain(5);
        events[1].message = "rewritten".into();
        let err = verify_chain(&events).unwrap_err();
        assert!(err.contains("seq=2 digest mismatch"), "{}", err);

        // recomputing the tampered event only moves the break forward
        let (d, c) = compute_event_integrity(&events[1]);
        events[1].digest = d;
        events[1].crc32 = c;
        let err = verify_chain(&events).unwrap_err();
        assert!(err.contains("seq=3 prevDigest mismatch"), "{}", err);
    }

    #[test]
    fn test_error_fields_are_hashed() {
        let base = RunEvent::new("r", "n", EventType::NodeFailed);
        let with_err = base.clone().with_error(RunError::new("APPLY_FAILED", "boom"));
        assert_ne!(
            compute_event_integrity(&base).0,
            compute_event_integrity(&with_err).0
        );
    }

    #[test]
    fn test_run_digest_binds_all_inputs() {
        let d = compute_run_digest("{}", "{}", "sha256:x");
        assert_ne!(d, compute_run_digest("{ }", "{}", "sha256:x"));
        assert_ne!(d, compute_run_digest("{}", "{ }", "sha256:x"));
        assert_ne!(d, compute_run_digest("{}", "{}", "sha256:y"));
        assert_eq!(d, compute_run_digest("{}", "{}", "sha256:x"));
    }

    #[test]
    fn test_plan_hash_is_deterministic() {
        let node = |name: &str, set: &[(&str, &str)]| ResolvedRelease {
            id: format!("c/ns/{}", name),
            name: name.into(),
            set: set
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        let a = RunPlan {
            run_id: "r".into(),
            nodes: vec![node("a", &[("x", "1"), ("y", "2")]), node("b", &[])],
            ..Default::default()
        };
        let b = RunPlan {
            run_id: "r".into(),
            nodes: vec![node("a", &[("y", "2"), ("x", "1")]), node("b", &[])],
            ..Default::default()
        };
        let ha = compute_plan_hash(&a).unwrap();
        assert_eq!(ha, compute_plan_hash(&b).unwrap());

        let mut stamped = a.clone();
        stamped.plan_hash = ha.clone();
        assert_eq!(compute_plan_hash(&stamped).unwrap(), ha);
    }
}
