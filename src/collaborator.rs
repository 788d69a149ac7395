//! 외부 프로그램 연동
//!
//! - 송신 전: 원본 이미지를 컨테이너로 암호화 (`EncryptStage`)
//! - 수신 후: 조립된 컨테이너를 복호화 (`DecryptStage`)
//!
//! 외부 프로그램 실패는 로그만 남기고 프로토콜 상태에는 영향 없음

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// 외부 명령 (프로그램 + 고정 인자), 호출 시 경로 인자를 덧붙임
#[derive(Debug, Clone)]
pub struct Collaborator {
    program: OsString,
    base_args: Vec<OsString>,
}

impl Collaborator {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.base_args.push(arg.into());
        self
    }

    /// 공백으로 나뉜 명령줄에서 생성 (예: `"python3 /opt/decryption.py"`)
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(parts.fold(Self::new(program), |cmd, arg| cmd.arg(arg)))
    }

    /// 경로 인자를 붙여 실행, 비정상 종료면 에러
    pub async fn run(&self, paths: &[&Path]) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);
        command.args(paths);

        debug!("외부 프로그램 실행: {:?} {:?} {:?}", self.program, self.base_args, paths);
        let status = command.status().await?;

        if !status.success() {
            return Err(Error::Collaborator {
                program: self.program.to_string_lossy().into_owned(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// 원본 → 컨테이너 암호화 단계
#[derive(Debug, Clone)]
pub struct EncryptStage {
    pub collaborator: Collaborator,
    pub source_dir: PathBuf,
    pub key_path: PathBuf,
    /// 원본 확장자 (점 제외)
    pub extension: String,
}

impl EncryptStage {
    /// 원본 디렉터리를 훑어 오래된/없는 컨테이너를 다시 만듦
    ///
    /// 파일별 실패는 로그만 남기고 계속. 새로 만든 컨테이너 수 반환
    pub async fn refresh(&self, outbox: &Path) -> Result<usize> {
        if !self.source_dir.exists() {
            return Ok(0);
        }

        let mut sources = Vec::new();
        for entry in std::fs::read_dir(&self.source_dir)? {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ext.eq_ignore_ascii_case(&self.extension));
            if matches && path.is_file() {
                sources.push(path);
            }
        }
        sources.sort();

        let mut produced = 0;
        for source in sources {
            match self.encrypt_if_stale(&source, outbox).await {
                Ok(true) => produced += 1,
                Ok(false) => {}
                Err(e) => warn!("암호화 실패 {:?}: {}", source, e),
            }
        }
        Ok(produced)
    }

    /// 컨테이너가 원본보다 오래됐거나 없으면 암호화 실행
    async fn encrypt_if_stale(&self, source: &Path, outbox: &Path) -> Result<bool> {
        let Some(stem) = source.file_stem() else {
            return Ok(false);
        };
        let mut name = stem.to_os_string();
        name.push(".bin");
        let container = outbox.join(&name);
        name.push(crate::sender::SENT_SUFFIX);
        let sent_marker = outbox.join(&name);

        let source_mtime = modified(source)?.unwrap_or(SystemTime::UNIX_EPOCH);
        for existing in [&container, &sent_marker] {
            if let Some(mtime) = modified(existing)? {
                if mtime >= source_mtime {
                    return Ok(false);
                }
            }
        }

        self.collaborator
            .run(&[source, &self.key_path, &container])
            .await?;
        info!("Encrypted {:?} -> {:?}", source.file_name(), container.file_name());
        Ok(true)
    }
}

fn modified(path: &Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 수신 완료 컨테이너 → 복호화 단계
#[derive(Debug, Clone)]
pub struct DecryptStage {
    pub collaborator: Collaborator,
    pub output_dir: PathBuf,
    pub key_path: PathBuf,
}

impl DecryptStage {
    /// 복호화 실행. 실패해도 전송 결과는 바뀌지 않으므로 로그만 남김
    pub async fn hand_off(&self, artifact: &Path) {
        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            warn!("복호화 출력 디렉터리 생성 실패 {:?}: {}", self.output_dir, e);
            return;
        }

        match self
            .collaborator
            .run(&[artifact, &self.output_dir, &self.key_path])
            .await
        {
            Ok(()) => info!("attempted decrypt -> {:?}", self.output_dir),
            Err(e) => warn!("복호화 실패 {:?}: {}", artifact, e),
        }
    }
}
