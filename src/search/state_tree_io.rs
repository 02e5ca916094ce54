//! Binary image of a [`StateTree`].
//!
//! Layout (little endian):
//!
//! ```text
//! magic[8] version:u32 dependency_offset:u64
//! states, batches, second order batches, roots, coarticulation
//! dependency block at dependency_offset:
//!     acoustic model fingerprint[32] lexicon fingerprint[32] flags:u8
//! ```
//!
//! The dependency block is checked before anything else is decoded; a file
//! written for different models or construction flags is rejected.

use bytes::{Buf, BufMut, BytesMut};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::state_tree::{
    BatchId, CoarticulationStructure, Exit, State, StateDesc, StateTree, TreeDependencies,
    TreeFlags, INVALID_BATCH,
};
use crate::config::StateTreeConfig;
use crate::constants::persistence::{FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::error::{DecoderError, ErrorContext, Result, TreeFileError};
use crate::metrics;
use crate::models::{AcousticModel, Lexicon};
use crate::types::{Fingerprint, PhonemeId, PronunciationId, StateId, Transit};

const NO_PHONEME: u16 = u16::MAX;

/// Where a tree handed out by [`load_or_build`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSource {
    Loaded,
    Built,
    Rebuilt,
}

impl TreeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TreeSource::Loaded => "loaded",
            TreeSource::Built => "built",
            TreeSource::Rebuilt => "rebuilt",
        }
    }
}

fn put_phoneme(buf: &mut BytesMut, p: Option<PhonemeId>) {
    buf.put_u16_le(p.map_or(NO_PHONEME, |p| p.0));
}

/// Serialize a tree.
pub fn encode(tree: &StateTree) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + tree.states.len() * 16);
    buf.put_slice(MAGIC);
    buf.put_u32_le(FORMAT_VERSION);
    buf.put_u64_le(0);

    buf.put_u32_le(tree.states.len() as u32);
    for state in &tree.states {
        buf.put_u32_le(state.desc.acoustic_model);
        buf.put_u8(state.desc.transition_model_index);
        buf.put_i16_le(state.depth);
        buf.put_u32_le(state.successors);
        buf.put_u32_le(state.exits.len() as u32);
        for exit in &state.exits {
            buf.put_u32_le(exit.pronunciation.0);
            buf.put_u32_le(exit.transit_entry);
        }
    }

    buf.put_u32_le(tree.batches.len() as u32);
    for &b in &tree.batches {
        buf.put_u32_le(b);
    }
    buf.put_u32_le(tree.successor_batches.len() as u32);
    for &b in &tree.successor_batches {
        buf.put_u32_le(b);
    }
    buf.put_u32_le(tree.empty_batch);
    buf.put_u32_le(tree.root);
    buf.put_u32_le(tree.ci_root);

    buf.put_u32_le(tree.root_transits.len() as u32);
    for t in &tree.root_transits {
        put_phoneme(&mut buf, t.final_phoneme);
        put_phoneme(&mut buf, t.initial_phoneme);
    }

    match &tree.coarticulation {
        None => buf.put_u8(0),
        Some(cs) => {
            buf.put_u8(1);
            buf.put_u32_le(cs.initial_phonemes.len() as u32);
            for p in &cs.initial_phonemes {
                buf.put_u16_le(p.0);
            }
            buf.put_u32_le(cs.final_phonemes.len() as u32);
            for p in &cs.final_phonemes {
                buf.put_u16_le(p.0);
            }
            buf.put_u32_le(cs.roots.len() as u32);
            for &r in &cs.roots {
                buf.put_u32_le(r);
            }
        }
    }

    let dependency_offset = buf.len() as u64;
    let deps = &tree.dependencies;
    buf.put_slice(&deps.acoustic_model.0);
    buf.put_slice(&deps.lexicon.0);
    buf.put_u8(deps.flags.bits());
    buf[MAGIC.len() + 4..HEADER_SIZE].copy_from_slice(&dependency_offset.to_le_bytes());
    buf
}

struct Reader<'a> {
    buf: &'a [u8],
    section: &'static str,
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize) -> std::result::Result<(), TreeFileError> {
        if self.buf.remaining() < n {
            return Err(TreeFileError::Truncated {
                section: self.section,
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> std::result::Result<u8, TreeFileError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> std::result::Result<u16, TreeFileError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i16(&mut self) -> std::result::Result<i16, TreeFileError> {
        self.need(2)?;
        Ok(self.buf.get_i16_le())
    }

    fn u32(&mut self) -> std::result::Result<u32, TreeFileError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> std::result::Result<u64, TreeFileError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn fingerprint(&mut self) -> std::result::Result<Fingerprint, TreeFileError> {
        self.need(32)?;
        let mut fp = [0u8; 32];
        self.buf.copy_to_slice(&mut fp);
        Ok(Fingerprint(fp))
    }

    fn phoneme(&mut self) -> std::result::Result<Option<PhonemeId>, TreeFileError> {
        let p = self.u16()?;
        Ok((p != NO_PHONEME).then_some(PhonemeId(p)))
    }

    /// Element count, bounded by what the remaining bytes can hold.
    fn count(&mut self, element_size: usize) -> std::result::Result<usize, TreeFileError> {
        let n = self.u32()? as usize;
        self.need(n.saturating_mul(element_size))?;
        Ok(n)
    }

    fn u32_vec(&mut self) -> std::result::Result<Vec<u32>, TreeFileError> {
        let n = self.count(4)?;
        Ok((0..n).map(|_| self.buf.get_u32_le()).collect())
    }

    fn phoneme_vec(&mut self) -> std::result::Result<Vec<PhonemeId>, TreeFileError> {
        let n = self.count(2)?;
        Ok((0..n).map(|_| PhonemeId(self.buf.get_u16_le())).collect())
    }
}

fn describe_mismatch(expected: &TreeDependencies, found: &TreeDependencies) -> String {
    let mut parts = Vec::new();
    if expected.acoustic_model != found.acoustic_model {
        parts.push(format!(
            "acoustic model {} != {}",
            found.acoustic_model, expected.acoustic_model
        ));
    }
    if expected.lexicon != found.lexicon {
        parts.push(format!("lexicon {} != {}", found.lexicon, expected.lexicon));
    }
    if expected.flags != found.flags {
        parts.push(format!("flags {:?} != {:?}", found.flags, expected.flags));
    }
    parts.join(", ")
}

/// Deserialize a tree written for `expected` dependencies.
pub fn decode(
    data: &[u8],
    expected: &TreeDependencies,
    acoustic_model: &dyn AcousticModel,
) -> std::result::Result<StateTree, TreeFileError> {
    let mut r = Reader {
        buf: data,
        section: "header",
    };
    r.need(HEADER_SIZE)?;
    if &r.buf[..MAGIC.len()] != MAGIC {
        return Err(TreeFileError::BadMagic);
    }
    r.buf.advance(MAGIC.len());
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(TreeFileError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let dependency_offset = r.u64()? as usize;
    if dependency_offset < HEADER_SIZE || dependency_offset > data.len() {
        return Err(TreeFileError::Corrupt(format!(
            "dependency block offset {} out of range",
            dependency_offset
        )));
    }

    let mut d = Reader {
        buf: &data[dependency_offset..],
        section: "dependencies",
    };
    let found = TreeDependencies {
        acoustic_model: d.fingerprint()?,
        lexicon: d.fingerprint()?,
        flags: TreeFlags::from_bits(d.u8()?),
    };
    if found != *expected {
        return Err(TreeFileError::DependencyMismatch(describe_mismatch(expected, &found)));
    }

    r.buf = &data[HEADER_SIZE..dependency_offset];
    r.section = "states";
    let n_states = r.count(15)?;
    let mut states = Vec::with_capacity(n_states);
    for _ in 0..n_states {
        let desc = StateDesc {
            acoustic_model: r.u32()?,
            transition_model_index: r.u8()?,
        };
        let depth = r.i16()?;
        let successors = r.u32()?;
        let n_exits = r.count(8)?;
        let exits = (0..n_exits)
            .map(|_| Exit {
                pronunciation: PronunciationId(r.buf.get_u32_le()),
                transit_entry: r.buf.get_u32_le(),
            })
            .collect();
        states.push(State {
            desc,
            depth,
            exits,
            successors,
        });
    }

    r.section = "batches";
    let batches = r.u32_vec()?;
    let successor_batches = r.u32_vec()?;
    let empty_batch = r.u32()?;
    let root = r.u32()?;
    let ci_root = r.u32()?;

    r.section = "roots";
    let n_roots = r.count(4)?;
    let mut root_transits = Vec::with_capacity(n_roots);
    for _ in 0..n_roots {
        root_transits.push(Transit::new(r.phoneme()?, r.phoneme()?));
    }

    r.section = "coarticulation";
    let coarticulation = match r.u8()? {
        0 => None,
        1 => Some(CoarticulationStructure {
            initial_phonemes: r.phoneme_vec()?,
            final_phonemes: r.phoneme_vec()?,
            roots: r.u32_vec()?,
        }),
        other => {
            return Err(TreeFileError::Corrupt(format!(
                "coarticulation marker {}",
                other
            )))
        }
    };
    if r.buf.has_remaining() {
        return Err(TreeFileError::Corrupt(format!(
            "{} unexpected bytes before the dependency block",
            r.buf.remaining()
        )));
    }

    let tree = StateTree {
        states,
        batches,
        successor_batches,
        empty_batch,
        root,
        ci_root,
        root_transits,
        coarticulation,
        transition_models: acoustic_model.transition_models().to_vec(),
        dependencies: found,
    };
    validate(&tree, acoustic_model.n_emissions())?;
    Ok(tree)
}

/// Structural checks so that no index in a loaded tree is out of range and
/// successors always follow their predecessors.
fn validate(tree: &StateTree, n_emissions: u32) -> std::result::Result<(), TreeFileError> {
    let n_states = tree.states.len() as u32;
    let n_batches = tree.batches.len().saturating_sub(1) as BatchId;
    let corrupt = |what: String| Err(TreeFileError::Corrupt(what));

    if tree.batches.windows(2).any(|w| w[0] > w[1])
        || tree.batches.iter().any(|&b| b > n_states)
    {
        return corrupt("batch boundaries are not monotonic".to_string());
    }
    if tree.empty_batch >= n_batches {
        return corrupt(format!("empty batch {} out of range", tree.empty_batch));
    }
    if tree.root >= n_states || tree.ci_root >= n_states {
        return corrupt(format!("root {} / {} out of range", tree.root, tree.ci_root));
    }
    if tree.root_transits.len() > tree.states.len() {
        return corrupt("more roots than states".to_string());
    }
    let n_roots = tree.root_transits.len();
    for (i, state) in tree.states.iter().enumerate() {
        if state.successors == INVALID_BATCH || state.successors >= n_batches {
            return corrupt(format!("state {} has successor batch {}", i, state.successors));
        }
        let successors = tree.batch(state.successors);
        if !successors.is_empty() && successors.start as usize <= i {
            return corrupt(format!(
                "state {} precedes its successor batch {}",
                i, state.successors
            ));
        }
        // only the non-emitting roots lack an emission
        if i >= n_roots && state.desc.acoustic_model >= n_emissions {
            return corrupt(format!(
                "state {} uses emission {} of {}",
                i, state.desc.acoustic_model, n_emissions
            ));
        }
        if state.desc.transition_model_index as usize >= tree.transition_models.len() {
            return corrupt(format!(
                "state {} uses unknown transition model {}",
                i, state.desc.transition_model_index
            ));
        }
        if let Some(exit) = state.exits.iter().find(|e| e.transit_entry >= n_states) {
            return corrupt(format!("state {} exits into {}", i, exit.transit_entry));
        }
    }
    if !tree.successor_batches.is_empty() {
        let needed = tree
            .states
            .iter()
            .map(|s| s.successors as usize + 1)
            .max()
            .unwrap_or(0);
        if tree.successor_batches.len() < needed {
            return corrupt("second order batches do not cover all batches".to_string());
        }
        if tree.successor_batches.iter().any(|&b| b >= n_batches) {
            return corrupt("second order batch out of range".to_string());
        }
        for i in 0..tree.states.len() {
            let skips = tree.successors2(i as StateId);
            if !skips.is_empty() && skips.start as usize <= i {
                return corrupt(format!("state {} precedes its skip targets", i));
            }
        }
    }
    if let Some(cs) = &tree.coarticulation {
        if cs.roots.len() != cs.initial_phonemes.len() * cs.final_phonemes.len()
            || cs.roots.iter().any(|&r| r >= n_states)
        {
            return corrupt("coarticulated roots do not match their phoneme sets".to_string());
        }
    }
    Ok(())
}

/// Write a tree image to `path`.
pub fn write(tree: &StateTree, path: &Path) -> Result<()> {
    let data = encode(tree);
    fs::write(path, &data)
        .with_context(|| format!("storing state tree image at {}", path.display()))?;
    info!(path = %path.display(), bytes = data.len(), "state tree written");
    Ok(())
}

/// Read a tree image from `path`, rejecting files for other models.
pub fn read(
    path: &Path,
    lexicon: &Lexicon,
    acoustic_model: &dyn AcousticModel,
    config: &StateTreeConfig,
) -> Result<StateTree> {
    let data = fs::read(path).map_err(TreeFileError::Io)?;
    let expected = TreeDependencies::new(lexicon, acoustic_model, config);
    Ok(decode(&data, &expected, acoustic_model)?)
}

/// Load the configured tree image, or build the tree and store it.
///
/// Unusable images are never trusted: any read failure leads to a fresh
/// construction which then replaces the file.
pub fn load_or_build(
    lexicon: &Lexicon,
    acoustic_model: &dyn AcousticModel,
    config: &StateTreeConfig,
) -> Result<(StateTree, TreeSource)> {
    let Some(path) = config.file.as_deref() else {
        let tree = StateTree::build(lexicon, acoustic_model, config)?;
        metrics::record_state_tree_source(TreeSource::Built.as_str());
        return Ok((tree, TreeSource::Built));
    };

    let source = if path.exists() {
        match read(path, lexicon, acoustic_model, config) {
            Ok(tree) => {
                info!(path = %path.display(), states = tree.n_states(), "state tree loaded");
                metrics::record_state_tree_source(TreeSource::Loaded.as_str());
                return Ok((tree, TreeSource::Loaded));
            }
            Err(DecoderError::TreeFile(e)) => {
                warn!(path = %path.display(), error = %e, "state tree image rejected, rebuilding");
                TreeSource::Rebuilt
            }
            Err(e) => return Err(e),
        }
    } else {
        TreeSource::Built
    };

    let tree = StateTree::build(lexicon, acoustic_model, config)?;
    if let Err(e) = write(&tree, path) {
        warn!(path = %path.display(), error = %e, "failed to store state tree image");
    }
    metrics::record_state_tree_source(source.as_str());
    Ok((tree, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn assert_same_structure(a: &StateTree, b: &StateTree) {
        assert_eq!(a.n_states(), b.n_states());
        assert_eq!(a.root(), b.root());
        assert_eq!(a.ci_root(), b.ci_root());
        for s in 0..a.n_states() {
            assert_eq!(a.state(s), b.state(s));
            assert_eq!(a.successors(s), b.successors(s));
            assert_eq!(a.successors2(s), b.successors2(s));
            assert_eq!(a.word_ends(s), b.word_ends(s));
        }
        assert_eq!(a.coarticulation(), b.coarticulation());
    }

    #[test]
    fn test_file_round_trip() {
        for across_word in [false, true] {
            let lexicon = testutil::prefix_lexicon();
            let am = testutil::acoustic_model(&lexicon, across_word);
            let config = StateTreeConfig::default();
            let tree = StateTree::build(&lexicon, &am, &config).unwrap();

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tree.bin");
            write(&tree, &path).unwrap();
            let loaded = read(&path, &lexicon, &am, &config).unwrap();
            assert_same_structure(&tree, &loaded);
            assert!(loaded.is_consistent());
        }
    }

    #[test]
    fn test_rejects_other_dependencies() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let config = StateTreeConfig::default();
        let tree = StateTree::build(&lexicon, &am, &config).unwrap();
        let data = encode(&tree);

        let other_am = testutil::acoustic_model(&lexicon, true);
        let expected = TreeDependencies::new(&lexicon, &other_am, &config);
        assert!(matches!(
            decode(&data, &expected, &other_am),
            Err(TreeFileError::DependencyMismatch(_))
        ));

        let no_skip = StateTreeConfig {
            skip_transitions: false,
            ..config
        };
        let expected = TreeDependencies::new(&lexicon, &am, &no_skip);
        assert!(matches!(
            decode(&data, &expected, &am),
            Err(TreeFileError::DependencyMismatch(_))
        ));
    }

    #[test]
    fn test_rejects_damaged_images() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let config = StateTreeConfig::default();
        let tree = StateTree::build(&lexicon, &am, &config).unwrap();
        let expected = TreeDependencies::new(&lexicon, &am, &config);
        let data = encode(&tree);

        let mut bad_magic = data.to_vec();
        bad_magic[0] = b'X';
        assert!(matches!(decode(&bad_magic, &expected, &am), Err(TreeFileError::BadMagic)));

        let mut bad_version = data.to_vec();
        bad_version[8] = 99;
        assert!(matches!(
            decode(&bad_version, &expected, &am),
            Err(TreeFileError::UnsupportedVersion { found: 99, .. })
        ));

        assert!(decode(&data[..10], &expected, &am).is_err());

        // cut into the payload but keep a valid dependency block reference
        let mut truncated = data.to_vec();
        let offset = u64::from_le_bytes(truncated[12..20].try_into().unwrap()) as usize;
        truncated.drain(HEADER_SIZE + 8..offset);
        let new_offset = (HEADER_SIZE + 8) as u64;
        truncated[12..20].copy_from_slice(&new_offset.to_le_bytes());
        assert!(decode(&truncated, &expected, &am).is_err());
    }

    #[test]
    fn test_load_or_build_recovers() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let dir = tempfile::tempdir().unwrap();
        let config = StateTreeConfig {
            file: Some(dir.path().join("tree.bin")),
            ..StateTreeConfig::default()
        };

        let (first, source) = load_or_build(&lexicon, &am, &config).unwrap();
        assert_eq!(source, TreeSource::Built);
        let (second, source) = load_or_build(&lexicon, &am, &config).unwrap();
        assert_eq!(source, TreeSource::Loaded);
        assert_same_structure(&first, &second);

        fs::write(config.file.as_ref().unwrap(), b"garbage").unwrap();
        let (third, source) = load_or_build(&lexicon, &am, &config).unwrap();
        assert_eq!(source, TreeSource::Rebuilt);
        assert_same_structure(&first, &third);

        // a different model invalidates the stored image
        let other_am = testutil::acoustic_model(&lexicon, true);
        let (_, source) = load_or_build(&lexicon, &other_am, &config).unwrap();
        assert_eq!(source, TreeSource::Rebuilt);
    }

    #[test]
    fn test_corrupt_payload_falls_back_to_construction() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.bin");
        let config = StateTreeConfig {
            file: Some(path.clone()),
            ..StateTreeConfig::default()
        };
        let fresh = StateTree::build(&lexicon, &am, &config).unwrap();
        let first_emitting = fresh.root_transits.len();
        let last = fresh.states.len() - 1;

        let mut bad_emission = fresh.clone();
        bad_emission.states[first_emitting].desc.acoustic_model = am.n_emissions();
        // the deepest state continuing into the first word states
        let mut backward = fresh.clone();
        backward.states[last].successors = fresh.states[fresh.root as usize].successors;

        for damaged in [bad_emission, backward] {
            fs::write(&path, encode(&damaged)).unwrap();
            assert!(matches!(
                read(&path, &lexicon, &am, &config),
                Err(DecoderError::TreeFile(TreeFileError::Corrupt(_)))
            ));
            let (tree, source) = load_or_build(&lexicon, &am, &config).unwrap();
            assert_eq!(source, TreeSource::Rebuilt);
            assert_same_structure(&fresh, &tree);
        }
    }

    #[test]
    fn test_write_names_destination_on_failure() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("tree.bin");
        let err = write(&tree, &path).unwrap_err();
        assert!(matches!(err, DecoderError::Internal(_)));
        assert!(err.to_string().contains("tree.bin"));
    }
}
