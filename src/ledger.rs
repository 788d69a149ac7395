//! 전달 완료 해시 ledger
//!
//! 역할별 파일 하나, 줄 단위 소문자 hex, append-only.
//! 시작 시 전부 메모리로 읽고, 새 성공마다 동기적으로 한 줄 추가

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::digest::ContentHash;
use crate::Result;

/// 해시 ledger
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: HashSet<ContentHash>,
}

impl Ledger {
    /// ledger 파일 로드 (없으면 빈 ledger)
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashSet::new();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            let text = fs::read_to_string(&path)?;
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match line.parse::<ContentHash>() {
                    Ok(hash) => {
                        entries.insert(hash);
                    }
                    Err(_) => warn!("ledger {:?}: 잘못된 줄 무시: {:?}", path, line),
                }
            }
        }

        info!("ledger {:?}: {} hashes loaded", path, entries.len());

        Ok(Self { path, entries })
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.contains(hash)
    }

    /// 해시 기록. 이미 있으면 파일을 건드리지 않고 `false`
    pub fn record(&mut self, hash: ContentHash) -> Result<bool> {
        if self.entries.contains(&hash) {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", hash.to_hex())?;
        file.sync_data()?;

        self.entries.insert(hash);
        debug!("ledger {:?}: recorded {}", self.path, hash);
        Ok(true)
    }

    /// `dir` 안의 `suffix`로 끝나는 마커 파일 해시를 ledger에 반영
    ///
    /// ledger 줄이 없는 마커만 추가하므로 중복 줄은 생기지 않음
    pub fn reconcile_markers(&mut self, dir: &Path, suffix: &str) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut added = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_marker = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.ends_with(suffix));
            if !is_marker || !path.is_file() {
                continue;
            }

            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!("마커 파일 해시 실패 {:?}: {}", path, e);
                    continue;
                }
            };

            if self.record(ContentHash::of(&data))? {
                added += 1;
            }
        }

        if added > 0 {
            info!("ledger {:?}: reconciled {} marker files", self.path, added);
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
