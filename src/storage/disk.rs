//! ディスクストレージ
//!
//! 2階層の16進数ディレクトリツリーにオブジェクトを永続化します。
//!
//! ## ディスクレイアウト
//!
//! ```text
//! {root}/.cache-storage                      ← パートサイズを記録するセンチネル
//! {root}/{cache_key}/ab/cd/abcd…{hex}/objID  ← メタデータ（JSON）
//! {root}/{cache_key}/ab/cd/abcd…{hex}/000042 ← パート42の生バイト列
//! ```
//!
//! `skip_cache_key_in_path`が有効な場合は`{cache_key}`階層を省略します。
//! 全ての書き込みはランダムサフィックス付き一時ファイルへ行い、
//! 同一ファイルシステム内のrenameで確定します。

use super::{IterateFlow, IterateVisitor, Storage};
use crate::config::CacheZoneConfig;
use crate::error::{CacheError, Result};
use crate::types::range::part_size_of;
use crate::types::{parse_part_filename, ObjectId, ObjectIndex, ObjectMetadata};
use ftlog::{error, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// メタデータファイル名
const METADATA_FILENAME: &str = "objID";

/// センチネルファイル名
const SENTINEL_FILENAME: &str = ".cache-storage";

/// コピー時のバッファサイズ
const COPY_BUF_SIZE: usize = 64 * 1024;

/// センチネルファイルの内容
///
/// 前回の起動時に使われたパートサイズを記録し、
/// 設定変更による静かなデータ破壊を防ぎます。
#[derive(Serialize, Deserialize)]
struct StorageSentinel {
    part_size: u64,
}

/// ディスクストレージ
pub struct DiskStorage {
    part_size: u64,
    root: PathBuf,
    dir_permissions: u32,
    file_permissions: u32,
    skip_cache_key_in_path: bool,
}

impl DiskStorage {
    /// 新しいディスクストレージを初期化
    ///
    /// ルートディレクトリは事前に作成されている必要があります。
    /// センチネルのパートサイズが設定と一致しない場合は起動を中止します。
    pub fn new(cfg: &CacheZoneConfig) -> Result<Self> {
        if cfg.part_size == 0 {
            return Err(CacheError::Config(format!(
                "cache zone `{}` has invalid part_size 0",
                cfg.id
            )));
        }

        let meta = fs::metadata(&cfg.path).map_err(|e| {
            CacheError::Config(format!(
                "storage path `{}` is not usable: {}",
                cfg.path.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(CacheError::Config(format!(
                "storage path `{}` is not a directory",
                cfg.path.display()
            )));
        }

        let storage = Self {
            part_size: cfg.part_size,
            root: cfg.path.clone(),
            dir_permissions: cfg.dir_permissions,
            file_permissions: cfg.file_permissions,
            skip_cache_key_in_path: cfg.skip_cache_key_in_path,
        };
        storage.check_and_save_sentinel()?;

        Ok(storage)
    }

    /// センチネルの検証と保存
    fn check_and_save_sentinel(&self) -> Result<()> {
        let path = self.root.join(SENTINEL_FILENAME);

        match File::open(&path) {
            Ok(file) => {
                let old: StorageSentinel = serde_json::from_reader(file).map_err(|e| {
                    CacheError::Config(format!(
                        "cannot parse storage sentinel {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                if old.part_size != self.part_size {
                    return Err(CacheError::Config(format!(
                        "storage at `{}` was created with part_size {} but the \
                         configuration now says {}",
                        self.root.display(),
                        old.part_size,
                        self.part_size
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::Io(e)),
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.file_permissions)
            .open(&path)
            .map_err(CacheError::from_io)?;
        serde_json::to_writer(file, &StorageSentinel { part_size: self.part_size })
            .map_err(|e| CacheError::Corrupt(format!("cannot write sentinel: {}", e)))?;
        Ok(())
    }

    /// オブジェクトのディレクトリパス
    fn object_dir(&self, id: &ObjectId) -> PathBuf {
        let (dir1, dir2) = id.hex_prefixes();
        let mut path = self.root.clone();
        if !self.skip_cache_key_in_path {
            path.push(id.cache_key());
        }
        path.push(dir1);
        path.push(dir2);
        path.push(id.hex());
        path
    }

    /// メタデータファイルのパス
    fn metadata_path(&self, id: &ObjectId) -> PathBuf {
        self.object_dir(id).join(METADATA_FILENAME)
    }

    /// パートファイルのパス
    fn part_path(&self, idx: &ObjectIndex) -> PathBuf {
        self.object_dir(&idx.id).join(idx.filename())
    }

    /// 親ディレクトリを作成してからファイルを排他的に作成
    fn create_file(&self, path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(self.dir_permissions)
                .create(parent)
                .map_err(CacheError::from_io)?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(self.file_permissions)
            .open(path)
            .map_err(CacheError::from_io)
    }

    /// パスから直接メタデータを読み込んで検証
    fn read_metadata_file(&self, path: &Path) -> Result<ObjectMetadata> {
        let file = File::open(path).map_err(CacheError::from_io)?;
        let meta: ObjectMetadata = serde_json::from_reader(file)
            .map_err(|e| CacheError::Corrupt(format!("{}: {}", path.display(), e)))?;

        // ディレクトリ名とIDハッシュの整合性を検証
        let dir_name = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if dir_name != meta.id.hex() {
            return Err(CacheError::Corrupt(format!(
                "object {} found in wrong directory {}",
                meta.id,
                path.display()
            )));
        }

        Ok(meta)
    }

    /// イテレーション対象のルートディレクトリを列挙するglobパターン
    fn iterate_glob(&self) -> String {
        let levels = if self.skip_cache_key_in_path {
            "[0-9a-f][0-9a-f]/[0-9a-f][0-9a-f]"
        } else {
            "*/[0-9a-f][0-9a-f]/[0-9a-f][0-9a-f]"
        };
        format!("{}/{}", self.root.display(), levels)
    }
}

impl Storage for DiskStorage {
    fn part_size(&self) -> u64 {
        self.part_size
    }

    fn get_metadata(&self, id: &ObjectId) -> Result<ObjectMetadata> {
        self.read_metadata_file(&self.metadata_path(id))
    }

    fn save_metadata(&self, meta: &ObjectMetadata) -> Result<()> {
        let final_path = self.metadata_path(&meta.id);
        if final_path.exists() {
            return Err(CacheError::AlreadyExists);
        }

        let tmp_path = with_random_suffix(&final_path);
        let file = self.create_file(&tmp_path)?;
        if let Err(e) = serde_json::to_writer(&file, meta) {
            let _ = fs::remove_file(&tmp_path);
            return Err(CacheError::Io(io::Error::new(io::ErrorKind::Other, e)));
        }
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(CacheError::from_io)
    }

    fn replace_metadata(&self, meta: &ObjectMetadata) -> Result<()> {
        let final_path = self.metadata_path(&meta.id);

        let tmp_path = with_random_suffix(&final_path);
        let file = self.create_file(&tmp_path)?;
        if let Err(e) = serde_json::to_writer(&file, meta) {
            let _ = fs::remove_file(&tmp_path);
            return Err(CacheError::Io(io::Error::new(io::ErrorKind::Other, e)));
        }
        drop(file);

        // renameは既存のobjIDを原子的に上書きする
        fs::rename(&tmp_path, &final_path).map_err(CacheError::from_io)
    }

    fn get_part(&self, idx: &ObjectIndex) -> Result<Box<dyn Read + Send>> {
        let path = self.part_path(idx);
        let file = File::open(&path).map_err(CacheError::from_io)?;
        let size = file.metadata().map_err(CacheError::from_io)?.len();

        if size > self.part_size {
            // 壊れたパートは残しておいても読めないので破棄する
            let _ = self.discard_part(idx);
            return Err(CacheError::Corrupt(format!(
                "part {} has invalid size {}",
                idx, size
            )));
        }

        Ok(Box::new(file))
    }

    fn save_part(&self, idx: &ObjectIndex, data: &mut dyn Read) -> Result<()> {
        // パートはメタデータの存在するオブジェクトにのみ保存できる
        if !self.metadata_path(&idx.id).exists() {
            return Err(CacheError::NotFound);
        }

        let final_path = self.part_path(idx);
        if final_path.exists() {
            return Err(CacheError::AlreadyExists);
        }

        let tmp_path = with_random_suffix(&final_path);
        let mut file = self.create_file(&tmp_path)?;

        let mut written: u64 = 0;
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&tmp_path);
                    return Err(CacheError::Io(e));
                }
            };
            written += n as u64;
            if written > self.part_size {
                drop(file);
                let _ = fs::remove_file(&tmp_path);
                return Err(CacheError::InvalidSize);
            }
            if let Err(e) = file.write_all(&buf[..n]) {
                drop(file);
                let _ = fs::remove_file(&tmp_path);
                return Err(CacheError::Io(e));
            }
        }
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(CacheError::from_io)
    }

    fn get_available_parts(&self, id: &ObjectId) -> Result<Vec<ObjectIndex>> {
        let dir = self.object_dir(id);

        // メタデータが読めれば各パートの期待サイズを厳密に検証できる。
        // 読めない場合は上限チェックだけに落とす。
        let object_size = self
            .read_metadata_file(&dir.join(METADATA_FILENAME))
            .ok()
            .map(|meta| meta.size);

        let entries = fs::read_dir(&dir).map_err(CacheError::from_io)?;

        let mut parts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(CacheError::from_io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == METADATA_FILENAME {
                continue;
            }

            let part = match parse_part_filename(&name) {
                Some(p) => p,
                None => {
                    // 書き込み途中の一時ファイル等は読み飛ばす
                    warn!("[DiskStorage] unknown file {} in {}", name, dir.display());
                    continue;
                }
            };

            let size = entry.metadata().map_err(CacheError::from_io)?.len();
            let valid = match object_size {
                Some(object_size) => size == part_size_of(part, object_size, self.part_size),
                None => size <= self.part_size,
            };
            if !valid {
                warn!(
                    "[DiskStorage] part {} of {} has invalid size {}, skipping",
                    part, id, size
                );
                continue;
            }

            parts.push(ObjectIndex::new(id.clone(), part));
        }

        parts.sort_by_key(|idx| idx.part);
        Ok(parts)
    }

    fn discard(&self, id: &ObjectId) -> Result<()> {
        let dir = self.object_dir(id);
        let tmp = with_random_suffix(&dir);
        // まずrenameで不可視にしてから中身を消す
        fs::rename(&dir, &tmp).map_err(CacheError::from_io)?;
        fs::remove_dir_all(&tmp).map_err(CacheError::from_io)
    }

    fn discard_part(&self, idx: &ObjectIndex) -> Result<()> {
        fs::remove_file(self.part_path(idx)).map_err(CacheError::from_io)
    }

    fn iterate(&self, visitor: &mut dyn IterateVisitor) -> Result<()> {
        let pattern = self.iterate_glob();
        let roots = glob::glob(&pattern)
            .map_err(|e| CacheError::Corrupt(format!("bad iterate pattern: {}", e)))?;

        for root in roots {
            let root = match root {
                Ok(p) => p,
                Err(e) => {
                    error!("[DiskStorage] error while globbing: {}", e);
                    continue;
                }
            };

            let entries = fs::read_dir(&root).map_err(CacheError::from_io)?;
            for entry in entries {
                let entry = entry.map_err(CacheError::from_io)?;
                let metadata_path = entry.path().join(METADATA_FILENAME);

                let meta = match self.read_metadata_file(&metadata_path) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(
                            "[DiskStorage] cannot read metadata from {}: {}",
                            metadata_path.display(),
                            e
                        );
                        continue;
                    }
                };

                let parts = match self.get_available_parts(&meta.id) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(
                            "[DiskStorage] cannot list parts of {}: {}",
                            meta.id, e
                        );
                        continue;
                    }
                };

                if visitor.on_object(&meta, &parts) == IterateFlow::Stop {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// パスにランダムな16進サフィックスを付与
///
/// 一時ファイルと破棄中ディレクトリの名前衝突を避けます。
fn with_random_suffix(path: &Path) -> PathBuf {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('_');
    name.push_str(&suffix);
    path.with_file_name(name)
}
