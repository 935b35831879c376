//! Binary serialization of a [`FileRegistry`] snapshot: six fixed-order sections, each
//! `uvarint(count) || record*`, with record sizes chosen so a truncated restore fails
//! deterministically rather than silently dropping records (spec §4.4/§6).

use crate::error::{Error, Result};
use crate::state_index::StateIndex;
use crate::uvarint;

use super::{
    FileRegistry, FixedDescriptor, Kind, LogDescriptor, MergeDescriptor, SnapshotDescriptor,
    TemporaryDescriptor, UnusedDescriptor,
};

fn push_id(out: &mut Vec<u8>, id: StateIndex) {
    out.extend_from_slice(&id.to_bytes());
}

fn take_id<'a>(buf: &'a [u8]) -> Result<(StateIndex, &'a [u8])> {
    let (bytes, rest) = crate::byteop::split(buf, 16)?;
    let id = StateIndex::decode(bytes)
        .ok_or_else(|| Error::invalid_encoding(0, "truncated state index"))?;
    Ok((id, rest))
}

fn take_u64(buf: &[u8]) -> Result<(u64, &[u8])> {
    let (bytes, rest) = crate::byteop::split(buf, 8)?;
    Ok((u64::from_le_bytes(bytes.try_into().unwrap()), rest))
}

fn take_i32(buf: &[u8]) -> Result<(i32, &[u8])> {
    let (bytes, rest) = crate::byteop::split(buf, 4)?;
    Ok((i32::from_le_bytes(bytes.try_into().unwrap()), rest))
}

/// Serializes `registry` into `out`, appending (never clearing first).
pub fn encode(registry: &FileRegistry, out: &mut Vec<u8>) -> Result<()> {
    uvarint::write(out, registry.unused.len() as u64)?;
    for d in &registry.unused {
        out.extend_from_slice(&d.kind.to_i32().to_le_bytes());
        push_id(out, d.id);
        push_id(out, d.last_used);
        out.extend_from_slice(&d.size.to_le_bytes());
        if d.kind == Kind::Fixed {
            let delay = d.delay.ok_or_else(|| {
                Error::internal("fixed-kind unused descriptor missing its delay")
            })?;
            out.extend_from_slice(&delay.to_le_bytes());
        }
    }

    uvarint::write(out, registry.logs.len() as u64)?;
    for d in &registry.logs {
        push_id(out, d.id);
        push_id(out, d.first_id);
        push_id(out, d.last_id);
        out.extend_from_slice(&d.read.to_le_bytes());
        out.extend_from_slice(&d.write.to_le_bytes());
    }

    uvarint::write(out, registry.snapshots.len() as u64)?;
    for d in &registry.snapshots {
        push_id(out, d.id);
        out.extend_from_slice(&d.read.to_le_bytes());
        out.extend_from_slice(&d.read_area.to_le_bytes());
        out.extend_from_slice(&d.size.to_le_bytes());
    }

    uvarint::write(out, registry.merges.len() as u64)?;
    for d in &registry.merges {
        push_id(out, d.id);
        out.extend_from_slice(&d.read.to_le_bytes());
        out.extend_from_slice(&d.size.to_le_bytes());
    }

    uvarint::write(out, registry.fixeds.len() as u64)?;
    for d in &registry.fixeds {
        push_id(out, d.id);
        out.extend_from_slice(&d.read.to_le_bytes());
        out.extend_from_slice(&d.write.to_le_bytes());
        out.extend_from_slice(&d.delay.to_le_bytes());
    }

    uvarint::write(out, registry.temporaries.len() as u64)?;
    for d in &registry.temporaries {
        push_id(out, d.id);
    }

    Ok(())
}

/// Parses a registry dump produced by [`encode`]. Any strict prefix of a valid dump
/// fails: every fixed-size record read uses [`crate::byteop::split`], which errors on
/// a short buffer rather than padding with zeros.
pub fn decode(buf: &[u8]) -> Result<FileRegistry> {
    let mut registry = FileRegistry::new();

    let (count, mut rest) = uvarint::read(buf)?;
    for _ in 0..count {
        let (kind_bytes, r) = crate::byteop::split(rest, 4)?;
        let kind = Kind::from_i32(i32::from_le_bytes(kind_bytes.try_into().unwrap()))?;
        let (id, r) = take_id(r)?;
        let (last_used, r) = take_id(r)?;
        let (size, r) = take_u64(r)?;
        let (delay, r) = if kind == Kind::Fixed {
            let (delay, r) = take_i32(r)?;
            (Some(delay), r)
        } else {
            (None, r)
        };
        registry.unused.push(UnusedDescriptor {
            kind,
            id,
            last_used,
            size,
            delay,
        });
        rest = r;
    }

    let (count, mut r) = uvarint::read(rest)?;
    for _ in 0..count {
        let (id, r2) = take_id(r)?;
        let (first_id, r2) = take_id(r2)?;
        let (last_id, r2) = take_id(r2)?;
        let (read, r2) = take_u64(r2)?;
        let (write, r2) = take_u64(r2)?;
        registry.logs.push(LogDescriptor {
            id,
            first_id,
            last_id,
            read,
            write,
        });
        r = r2;
    }
    rest = r;

    let (count, mut r) = uvarint::read(rest)?;
    for _ in 0..count {
        let (id, r2) = take_id(r)?;
        let (read, r2) = take_u64(r2)?;
        let (read_area, r2) = take_u64(r2)?;
        let (size, r2) = take_u64(r2)?;
        registry.snapshots.push(SnapshotDescriptor {
            id,
            read,
            read_area,
            size,
        });
        r = r2;
    }
    rest = r;

    let (count, mut r) = uvarint::read(rest)?;
    for _ in 0..count {
        let (id, r2) = take_id(r)?;
        let (read, r2) = take_u64(r2)?;
        let (size, r2) = take_u64(r2)?;
        registry.merges.push(MergeDescriptor { id, read, size });
        r = r2;
    }
    rest = r;

    let (count, mut r) = uvarint::read(rest)?;
    for _ in 0..count {
        let (id, r2) = take_id(r)?;
        let (read, r2) = take_u64(r2)?;
        let (write, r2) = take_u64(r2)?;
        let (delay, r2) = take_i32(r2)?;
        registry.fixeds.push(FixedDescriptor {
            id,
            read,
            write,
            delay,
        });
        r = r2;
    }
    rest = r;

    let (count, mut r) = uvarint::read(rest)?;
    for _ in 0..count {
        let (id, r2) = take_id(r)?;
        registry.temporaries.push(TemporaryDescriptor { id });
        r = r2;
    }
    rest = r;

    if !rest.is_empty() {
        return Err(Error::invalid_encoding(
            0,
            "trailing bytes after a complete registry dump",
        ));
    }

    registry.stats = super::Stats {
        logs: registry.logs.len(),
        snapshots: registry.snapshots.len(),
        merges: registry.merges.len(),
        fixeds: registry.fixeds.len(),
        temporaries: registry.temporaries.len(),
        unused: registry.unused.len(),
        unused_size: registry.unused.iter().map(|d| d.size).sum(),
    };
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FileRegistry;

    fn populated() -> FileRegistry {
        let mut reg = FileRegistry::new();
        let log = reg.new_log(StateIndex::new(1, 0));
        reg.next_write(log, 10, Some(StateIndex::new(1, 1))).unwrap();

        let snap = reg.new_snapshot(StateIndex::new(2, 0));
        reg.next_write(snap, 20, None).unwrap();

        let merge = reg.new_merge(StateIndex::new(3, 0));
        reg.next_write(merge, 30, None).unwrap();

        let fixed = reg.new_fixed(StateIndex::new(4, 0), 60);
        reg.next_write(fixed, 40, None).unwrap();

        reg.new_temporary(StateIndex::new(5, 0));

        let unused_merge = reg.new_merge(StateIndex::new(6, 0));
        reg.next_write(unused_merge, 5, None).unwrap();
        reg.remove(unused_merge, StateIndex::new(7, 0)).unwrap();

        let unused_fixed = reg.new_fixed(StateIndex::new(8, 0), 90);
        reg.next_write(unused_fixed, 6, None).unwrap();
        reg.remove(unused_fixed, StateIndex::new(9, 0)).unwrap();

        reg
    }

    #[test]
    fn round_trips_one_of_each_descriptor_kind() {
        let reg = populated();
        let mut buf = Vec::new();
        encode(&reg, &mut buf).unwrap();
        let restored = decode(&buf).unwrap();

        assert_eq!(restored.stats(), reg.stats());
        assert_eq!(restored.logs.len(), 1);
        assert_eq!(restored.snapshots.len(), 1);
        assert_eq!(restored.merges.len(), 1);
        assert_eq!(restored.fixeds.len(), 1);
        assert_eq!(restored.temporaries.len(), 1);
        assert_eq!(restored.unused.len(), 2);
    }

    #[test]
    fn any_strict_prefix_fails_to_parse() {
        let reg = populated();
        let mut buf = Vec::new();
        encode(&reg, &mut buf).unwrap();

        for len in 0..buf.len() {
            assert!(decode(&buf[..len]).is_err(), "prefix of length {len} should not parse");
        }
        assert!(decode(&buf).is_ok());
    }

    fn arbitrary_registry(n_logs: u8, n_snapshots: u8, n_merges: u8, n_fixeds: u8, n_temps: u8, n_unused: u8) -> FileRegistry {
        let mut reg = FileRegistry::new();
        let mut term = 1u64;
        for _ in 0..n_logs {
            let h = reg.new_log(StateIndex::new(term, 0));
            reg.next_write(h, 10, Some(StateIndex::new(term, 1))).unwrap();
            term += 1;
        }
        for _ in 0..n_snapshots {
            let h = reg.new_snapshot(StateIndex::new(term, 0));
            reg.next_write(h, 20, None).unwrap();
            term += 1;
        }
        for _ in 0..n_merges {
            let h = reg.new_merge(StateIndex::new(term, 0));
            reg.next_write(h, 30, None).unwrap();
            term += 1;
        }
        for _ in 0..n_fixeds {
            let h = reg.new_fixed(StateIndex::new(term, 0), term as i32);
            reg.next_write(h, 40, None).unwrap();
            term += 1;
        }
        for _ in 0..n_temps {
            reg.new_temporary(StateIndex::new(term, 0));
            term += 1;
        }
        for _ in 0..n_unused {
            let h = reg.new_merge(StateIndex::new(term, 0));
            reg.next_write(h, 5, None).unwrap();
            reg.remove(h, StateIndex::new(term + 1, 0)).unwrap();
            term += 2;
        }
        reg
    }

    proptest::proptest! {
        #[test]
        fn prop_dump_restore_round_trips_arbitrary_descriptor_sets(
            n_logs in 0u8..5,
            n_snapshots in 0u8..5,
            n_merges in 0u8..5,
            n_fixeds in 0u8..5,
            n_temps in 0u8..5,
            n_unused in 0u8..5,
        ) {
            let reg = arbitrary_registry(n_logs, n_snapshots, n_merges, n_fixeds, n_temps, n_unused);
            let mut buf = Vec::new();
            encode(&reg, &mut buf).unwrap();
            let restored = decode(&buf).unwrap();
            proptest::prop_assert_eq!(restored.stats(), reg.stats());
            proptest::prop_assert_eq!(restored.logs.len(), reg.logs.len());
            proptest::prop_assert_eq!(restored.snapshots.len(), reg.snapshots.len());
            proptest::prop_assert_eq!(restored.merges.len(), reg.merges.len());
            proptest::prop_assert_eq!(restored.fixeds.len(), reg.fixeds.len());
            proptest::prop_assert_eq!(restored.temporaries.len(), reg.temporaries.len());
            proptest::prop_assert_eq!(restored.unused.len(), reg.unused.len());
        }
    }
}
