//! Shared fixtures for the unit tests.
//!
//! `Store` stands in for a real `age` installation: its `age` is a shell
//! script that "decrypts" a credential when the first line of the file equals
//! the identity file's contents, and prints the remainder.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use age_creds_core::config::credential_path;
use age_creds_core::{ActivationContext, Config, DecryptError, Decryptor, FileConfig, Overrides};
use socket2::{Domain, SockAddr, Socket, Type};
use zeroize::Zeroizing;

use crate::decrypt::AgeDecryptor;

const FAKE_AGE: &str = r#"#!/bin/sh
[ "$1" = "--decrypt" ] && [ "$2" = "--identity" ] || exit 2
key=$(cat "$3") || exit 1
[ "$(head -n 1 "$4" 2>/dev/null)" = "$key" ] || {
    echo "age: error: no identity matched any of the recipients" >&2
    exit 1
}
tail -n +2 "$4"
"#;

const SLOW_AGE: &str = "#!/bin/sh\nexec sleep 10\n";

const GOOD_KEY: &str = "good-key";

/// An abstract peer name no other test in this process will use.
pub fn unique_peer_name(unit: &str, credential: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("@{:x}{n:04x}/unit/{unit}/{credential}", std::process::id())
}

/// Connect to `path`, first binding to the abstract `name` (`@...`) if given.
pub fn connect_as(path: &Path, name: Option<&str>) -> io::Result<StdUnixStream> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    if let Some(name) = name {
        let abstract_name = format!("\0{}", name.trim_start_matches('@'));
        socket.bind(&SockAddr::unix(abstract_name)?)?;
    }
    socket.connect(&SockAddr::unix(path)?)?;
    Ok(socket.into())
}

/// Read until the server closes the connection.
pub fn read_all(mut stream: StdUnixStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Request `credential` as `unit`, the way a systemd service would.
pub fn read_credential(path: &Path, unit: &str, credential: &str) -> io::Result<Vec<u8>> {
    let name = unique_peer_name(unit, credential);
    read_all(connect_as(path, Some(&name))?)
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// A credential directory plus a fake `age` and two identities.
pub struct Store {
    _root: tempfile::TempDir,
    dir: PathBuf,
    age_bin: PathBuf,
    slow_age: PathBuf,
    identity: PathBuf,
    wrong_identity: PathBuf,
}

impl Store {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("credstore");
        let bin = root.path().join("bin");
        fs::create_dir(&dir).unwrap();
        fs::create_dir(&bin).unwrap();

        let age_bin = bin.join("age");
        let slow_age = bin.join("slow-age");
        write_script(&age_bin, FAKE_AGE);
        write_script(&slow_age, SLOW_AGE);

        let identity = root.path().join("identity.txt");
        let wrong_identity = root.path().join("wrong-identity.txt");
        fs::write(&identity, GOOD_KEY).unwrap();
        fs::write(&wrong_identity, "some-other-key").unwrap();

        Self {
            _root: root,
            dir,
            age_bin,
            slow_age,
            identity,
            wrong_identity,
        }
    }

    /// Store `plaintext` as `<id>.age`, replacing any previous version.
    pub fn add(&self, credential_id: &str, plaintext: &[u8]) {
        let mut contents = format!("{GOOD_KEY}\n").into_bytes();
        contents.extend_from_slice(plaintext);
        fs::write(credential_path(&self.dir, credential_id), contents).unwrap();
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn age_bin(&self) -> PathBuf {
        self.age_bin.clone()
    }

    /// An `age` that never finishes on its own.
    pub fn slow_age(&self) -> PathBuf {
        self.slow_age.clone()
    }

    pub fn identity(&self) -> PathBuf {
        self.identity.clone()
    }

    pub fn wrong_identity(&self) -> PathBuf {
        self.wrong_identity.clone()
    }

    pub fn decryptor(&self) -> AgeDecryptor {
        self.decryptor_with_identity(&self.identity)
    }

    pub fn decryptor_with_identity(&self, identity: &Path) -> AgeDecryptor {
        AgeDecryptor::new(self.age_bin(), identity, self.dir())
    }

    /// A daemon config pointing at this store, with default timeouts.
    pub fn config(&self, activation: ActivationContext) -> Config {
        let overrides = Overrides {
            age_bin: Some(self.age_bin()),
            identity: Some(self.identity()),
            dir: Some(self.dir.clone()),
            ..Overrides::default()
        };
        Config::resolve(FileConfig::default(), overrides, activation).unwrap()
    }
}

/// In-memory [`Decryptor`] that counts its calls.
#[derive(Default)]
pub struct StaticDecryptor {
    secrets: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticDecryptor {
    pub fn new<'a>(secrets: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            secrets: secrets
                .into_iter()
                .map(|(id, secret)| (id.to_string(), secret.as_bytes().to_vec()))
                .collect(),
            ..Self::default()
        }
    }

    /// Take `delay` to answer each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decryptor for StaticDecryptor {
    fn decrypt<'a>(
        &'a self,
        credential_id: &'a str,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<Zeroizing<Vec<u8>>, DecryptError>> + Send + 'a>>
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let path = PathBuf::from(format!("memory:{credential_id}"));
            if let Some(delay) = self.delay {
                let done = Instant::now() + delay;
                match deadline {
                    Some(deadline) if deadline < done => {
                        tokio::time::sleep_until(deadline.into()).await;
                        return Err(DecryptError::Timeout { path });
                    }
                    _ => tokio::time::sleep(delay).await,
                }
            }

            match self.secrets.get(credential_id) {
                Some(secret) => Ok(Zeroizing::new(secret.clone())),
                None => Err(DecryptError::Failed {
                    path,
                    status: ExitStatus::from_raw(1 << 8),
                    diagnostic: "no such credential".to_string(),
                }),
            }
        })
    }
}
