//! Repacks the partial volumes left by the packers at shutdown.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use dupvault_types::error::Result;

use crate::control::TaskControl;
use crate::volume::BlockVolumeReader;

use super::volumes::{OpenVolume, VolumeOpener};

pub struct SpillCollector {
    opener: VolumeOpener,
    control: Arc<TaskControl>,
}

impl SpillCollector {
    pub fn new(opener: VolumeOpener, control: Arc<TaskControl>) -> Self {
        Self { opener, control }
    }

    /// Merge `leftovers` into as few volumes as possible and queue them.
    ///
    /// Sources are taken from the front of the work list, targets from the
    /// back, so filled targets are never copied again.
    pub fn run(self, leftovers: Vec<OpenVolume>) -> Result<()> {
        let mut work: VecDeque<OpenVolume> = leftovers.into();
        if work.len() > 1 {
            info!(volumes = work.len(), "repacking partial volumes");
        }

        while work.len() > 1 {
            self.control.ensure_not_terminated()?;
            let Some(source) = work.pop_front() else {
                break;
            };
            let Some(target) = work.pop_back() else {
                work.push_front(source);
                break;
            };
            if let Some(target) = self.merge(source, target, &mut work)? {
                work.push_back(target);
            }
        }

        match work.pop_front() {
            Some(last) if last.is_empty() => self.opener.discard(last),
            Some(last) => self.opener.submit(last),
            None => Ok(()),
        }
    }

    /// Move every block of `source` into `target`, uploading targets as they
    /// fill. Returns the target still being filled, if any.
    fn merge(
        &self,
        source: OpenVolume,
        mut target: OpenVolume,
        work: &mut VecDeque<OpenVolume>,
    ) -> Result<Option<OpenVolume>> {
        let db = self.opener.db();
        let threshold = self.opener.config().blocks.volume_close_threshold();
        let OpenVolume {
            id: source_id,
            writer: source_writer,
            index: source_index,
        } = source;
        let source_name = source_writer.name().to_string();

        if let (Some(target_index), Some(source_index)) = (target.index.as_mut(), source_index.as_ref()) {
            target_index.copy_blocklists_from(source_index);
        }

        let closed = source_writer.close()?;
        let reader = BlockVolumeReader::open(&closed.path)?;
        debug!(
            source = %source_name,
            target = %target.name(),
            blocks = reader.entries().len(),
            "moving blocks"
        );

        let mut target = Some(target);
        for entry in reader.entries() {
            let mut current = match target.take() {
                Some(t) => t,
                None => match work.pop_back() {
                    Some(t) => t,
                    None => self.opener.open()?,
                },
            };
            current.writer.add_stored(entry, reader.read_stored(entry))?;
            db.move_block(entry.hash, entry.size, source_id, current.id)?;
            if let Some(index) = current.index.as_mut() {
                index.add_block(entry.hash, entry.size);
            }
            if current.writer.size() > threshold {
                self.opener.submit(current)?;
            } else {
                target = Some(current);
            }
        }

        closed.path.close()?;
        db.delete_or_deregister_volume(&source_name)?;
        if let Some(index) = &source_index {
            db.delete_or_deregister_volume(&index.name)?;
        }
        Ok(target)
    }
}
