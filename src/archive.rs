//! Moving data between the universe namespace and a region's private namespace.
//!
//! A region never reads universe state directly. Instead one side writes an archive file
//! (records stored sequentially, named after its content hash) and the other side reads the
//! records back in the same order. File names are
//! `regionq-{job}-{universe pe}-{round}-{in|out}-{hash}.ar`; the hash is verified on open, so a
//! truncated or modified file is rejected. Files are removed once read unless
//! `REGIONQ_KEEP_ARCHIVES` is set.
//!
//! The hand-off functions are collectives. When the region root fails to produce its archive,
//! the failure is broadcast and every member returns the same error. A failure after the
//! hand-off is seen by a single member and aborts the universe.

use crate::active_messaging::AmDist;
use crate::container::{DefaultPmap, WorldContainer};
use crate::world::World;
use crate::{config, Error};

use serde_bytes::ByteBuf;

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"RQAR";
const VERSION: u32 = 1;

/// Which way an archive moves data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// universe -> region
    In,
    /// region -> universe
    Out,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ArchiveFile {
    magic: [u8; 4],
    version: u32,
    records: Vec<ByteBuf>,
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// The archive files of one universe rank of one launch
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
    job_id: u64,
    pe: usize,
}

impl ArchiveStore {
    /// The store of the calling rank, in the configured archive directory
    pub fn new(world: &World) -> Result<ArchiveStore, Error> {
        ArchiveStore::with_dir(world, config().archive_dir())
    }

    /// The store of the calling rank in `dir`, created on the first write
    pub fn with_dir(world: &World, dir: impl Into<PathBuf>) -> Result<ArchiveStore, Error> {
        let dir = dir.into();
        // names carry the universe rank, whichever world the caller holds
        let pe = world.universe_pe(world.my_pe())?;
        Ok(ArchiveStore {
            dir,
            job_id: world.job_id(),
            pe,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn prefix(&self) -> String {
        format!("regionq-{:016x}-{}-", self.job_id, self.pe)
    }

    fn path(&self, round: usize, direction: Direction, hash: u64) -> PathBuf {
        self.dir.join(format!(
            "{}{}-{}-{:016x}.ar",
            self.prefix(),
            round,
            direction.as_str(),
            hash
        ))
    }

    /// Archive files of this rank still on disk
    pub fn list(&self) -> Result<Vec<PathBuf>, Error> {
        let pattern = self.dir.join(format!("{}*.ar", self.prefix()));
        let pattern = pattern
            .to_str()
            .ok_or_else(|| Error::Archive(format!("archive dir {:?} is not utf-8", self.dir)))?;
        let paths = glob::glob(pattern).map_err(|e| Error::Archive(e.to_string()))?;
        paths
            .map(|p| p.map_err(|e| Error::Archive(e.to_string())))
            .collect()
    }

    /// Removes every archive file of this rank, returns how many were removed
    pub fn purge(&self) -> Result<usize, Error> {
        let paths = self.list()?;
        for path in paths.iter() {
            std::fs::remove_file(path)?;
        }
        if !paths.is_empty() {
            tracing::debug!(pe = self.pe, cnt = paths.len(), "purged archive files");
        }
        Ok(paths.len())
    }

    /// Deletes a consumed archive unless archives are kept
    pub fn consumed(&self, path: &Path) -> Result<(), Error> {
        if !config().keep_archives {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Accumulates records, then writes them as one content-addressed file
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    records: Vec<ByteBuf>,
}

impl ArchiveWriter {
    pub fn new() -> ArchiveWriter {
        ArchiveWriter::default()
    }

    pub fn store<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        let bytes = crate::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.records.push(ByteBuf::from(bytes));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(
        self,
        store: &ArchiveStore,
        round: usize,
        direction: Direction,
    ) -> Result<PathBuf, Error> {
        let file = ArchiveFile {
            magic: MAGIC,
            version: VERSION,
            records: self.records,
        };
        let bytes = crate::serialize(&file).map_err(|e| Error::Serialization(e.to_string()))?;
        let path = store.path(round, direction, content_hash(&bytes));
        std::fs::create_dir_all(&store.dir)?;
        std::fs::write(&path, &bytes)?;
        tracing::trace!(?path, records = file.records.len(), "wrote archive");
        Ok(path)
    }
}

/// Reads back the records of an archive in the order they were stored
#[derive(Debug)]
pub struct ArchiveReader {
    records: VecDeque<ByteBuf>,
}

impl ArchiveReader {
    /// Opens and verifies an archive written by [ArchiveWriter::finish]
    pub fn open(path: &Path) -> Result<ArchiveReader, Error> {
        let expected = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.rsplit('-').next())
            .and_then(|hash| u64::from_str_radix(hash, 16).ok())
            .ok_or_else(|| Error::Archive(format!("{:?} is not an archive file name", path)))?;
        let bytes = std::fs::read(path)?;
        if content_hash(&bytes) != expected {
            return Err(Error::Archive(format!(
                "{:?} does not match its content hash",
                path
            )));
        }
        let file: ArchiveFile =
            crate::deserialize(&bytes).map_err(|e| Error::Archive(e.to_string()))?;
        if file.magic != MAGIC || file.version != VERSION {
            return Err(Error::Archive(format!(
                "{:?} is not a version {} archive",
                path, VERSION
            )));
        }
        Ok(ArchiveReader {
            records: file.records.into(),
        })
    }

    pub fn load<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, Error> {
        let record = self
            .records
            .pop_front()
            .ok_or_else(|| Error::Archive("no records left in archive".to_owned()))?;
        crate::deserialize(&record).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

fn committed<T>(world: &World, res: Result<T, Error>) -> T {
    res.unwrap_or_else(|e| world.abort(e))
}

fn root_failure(err: Error) -> String {
    match err {
        Error::Archive(msg) => msg,
        err => err.to_string(),
    }
}

impl ArchiveStore {
    fn write(
        &self,
        universe: &World,
        direction: Direction,
        fill: impl FnOnce(&mut ArchiveWriter) -> Result<(), Error>,
    ) -> Result<PathBuf, Error> {
        let mut writer = ArchiveWriter::new();
        fill(&mut writer)?;
        writer.finish(self, universe.next_archive_round(), direction)
    }

    fn read_back<T: AmDist>(&self, path: &Path) -> Result<T, Error> {
        let value = ArchiveReader::open(path)?.load()?;
        self.consumed(path)?;
        Ok(value)
    }

    /// [localize] through this store; only the region root's store is written to
    #[tracing::instrument(skip_all)]
    pub fn localize<T: AmDist>(
        &self,
        universe: &World,
        region: &World,
        value: &T,
    ) -> Result<T, Error> {
        let mut path: Result<PathBuf, String> = Err(String::new());
        if region.my_pe() == 0 {
            path = self
                .write(universe, Direction::In, |writer| writer.store(value))
                .map_err(root_failure);
        }
        region.broadcast(&mut path, 0);
        let path = path.map_err(Error::Archive)?;
        let localized = committed(
            region,
            ArchiveReader::open(&path).and_then(|mut reader| reader.load()),
        );
        region.barrier();
        if region.my_pe() == 0 {
            committed(region, self.consumed(&path));
        }
        Ok(localized)
    }

    /// [publish] through this store; only the region root's store is written to
    #[tracing::instrument(skip_all)]
    pub fn publish<T: AmDist>(
        &self,
        universe: &World,
        region: &World,
        value: &T,
    ) -> Result<Option<T>, Error> {
        let mut published = None;
        let mut status: Result<(), String> = Ok(());
        if region.my_pe() == 0 {
            let res = self
                .write(universe, Direction::Out, |writer| writer.store(value))
                .and_then(|path| self.read_back::<T>(&path));
            match res {
                Ok(value) => published = Some(value),
                Err(e) => status = Err(root_failure(e)),
            }
        }
        region.broadcast(&mut status, 0);
        status.map_err(Error::Archive)?;
        Ok(published)
    }

    /// [localize_container] through this store; only the region root's store is written to
    #[tracing::instrument(skip_all)]
    pub fn localize_container<V: AmDist>(
        &self,
        src: &WorldContainer<V>,
        region: &World,
        keys: &[i64],
    ) -> Result<WorldContainer<V>, Error> {
        let universe = src.world();
        let dst = WorldContainer::<V>::new(region, DefaultPmap);
        let mut path: Result<PathBuf, String> = Err(String::new());
        if region.my_pe() == 0 {
            let entries: Vec<(i64, V)> = keys
                .iter()
                .filter_map(|key| src.find(*key).map(|value| (*key, value)))
                .collect();
            path = self
                .write(universe, Direction::In, |writer| {
                    writer.store(&entries.len())?;
                    for entry in entries.iter() {
                        writer.store(entry)?;
                    }
                    Ok(())
                })
                .map_err(root_failure);
        }
        region.broadcast(&mut path, 0);
        let path = path.map_err(Error::Archive)?;
        let mut reader = committed(region, ArchiveReader::open(&path));
        let cnt: usize = committed(region, reader.load());
        for _ in 0..cnt {
            let (key, value): (i64, V) = committed(region, reader.load());
            // every member reads the whole archive and keeps what it owns
            if dst.is_local(key) {
                dst.insert(key, value);
            }
        }
        region.barrier();
        if region.my_pe() == 0 {
            committed(region, self.consumed(&path));
        }
        Ok(dst)
    }

    /// [publish_container] through this store
    #[tracing::instrument(skip_all)]
    pub fn publish_container<V: AmDist>(
        &self,
        src: &WorldContainer<V>,
        dst: &WorldContainer<V>,
    ) -> usize {
        let region = src.world();
        let path = committed(
            region,
            self.write(dst.world(), Direction::Out, |writer| {
                for entry in src.iter_local() {
                    writer.store(&entry)?;
                }
                Ok(())
            }),
        );
        let mut reader = committed(region, ArchiveReader::open(&path));
        let mut handles = Vec::with_capacity(reader.remaining());
        while reader.remaining() > 0 {
            let (key, value): (i64, V) = committed(region, reader.load());
            handles.push(dst.insert(key, value));
        }
        let cnt = handles.len();
        for handle in handles {
            handle.get();
        }
        committed(region, self.consumed(&path));
        region.barrier();
        cnt
    }
}

/// Collective over `region`: the region root writes `value` into an inbound archive and every
/// member reads it back, so all members return identical copies.
pub fn localize<T: AmDist>(universe: &World, region: &World, value: &T) -> Result<T, Error> {
    ArchiveStore::new(universe)?.localize(universe, region, value)
}

/// Collective over `region`: the region root writes its copy of `value` into an outbound
/// archive and reads it back on the universe side. The root returns `Some`, others `None`.
pub fn publish<T: AmDist>(universe: &World, region: &World, value: &T) -> Result<Option<T>, Error> {
    ArchiveStore::new(universe)?.publish(universe, region, value)
}

/// Collective over `region`: copies the entries under `keys` of the universe container `src`
/// into a new container on `region`. Absent keys are skipped.
pub fn localize_container<V: AmDist>(
    src: &WorldContainer<V>,
    region: &World,
    keys: &[i64],
) -> Result<WorldContainer<V>, Error> {
    ArchiveStore::new(src.world())?.localize_container(src, region, keys)
}

/// Collective over `src`'s world: every member archives its locally owned entries and
/// inserts them into the universe container `dst`. Returns how many entries this rank
/// published; they are all in `dst` when the call returns. Any failure aborts the universe.
pub fn publish_container<V: AmDist>(src: &WorldContainer<V>, dst: &WorldContainer<V>) -> usize {
    committed(src.world(), ArchiveStore::new(dst.world())).publish_container(src, dst)
}
