// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Shared fixtures for the integration tests: mock helper binaries that
//! record their invocations, a fake keyslot store, and a scripted queue
//! of recovery passphrases.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bootvault::{
    get_auxiliary_key_from_kernel, get_disk_unlock_key_from_kernel, register_platform_key_handler,
    AuxiliaryKey, DiskUnlockKey, HelperPaths, KeyData, KeyId, PlatformHandlerError,
    PlatformKeyHandler,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;

/// Name the mock platform handler registers under.
pub const MOCK_PLATFORM: &str = "mock";

/// A scratch environment with mock `systemd-cryptsetup`,
/// `systemd-ask-password` and `cryptsetup` binaries wired into a
/// [`HelperPaths`].
pub struct MockHelpers {
    dir: TempDir,
    keyslots_dir: PathBuf,
    keyslot_count: usize,
    passwords_file: PathBuf,
    attach_calls_file: PathBuf,
    askpass_calls_file: PathBuf,
    cryptsetup_calls_file: PathBuf,
    cryptsetup_inv_dir: PathBuf,
    pub attach_helper: PathBuf,
    pub paths: HelperPaths,
}

impl MockHelpers {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let keyslots_dir = root.join("keyslots");
        fs::create_dir(&keyslots_dir).unwrap();
        let run_dir = root.join("run");
        fs::create_dir(&run_dir).unwrap();
        let cryptsetup_inv_dir = root.join("invocations");
        fs::create_dir(&cryptsetup_inv_dir).unwrap();

        let passwords_file = root.join("passwords");
        fs::write(&passwords_file, "").unwrap();
        let attach_calls_file = root.join("attach-calls");
        let askpass_calls_file = root.join("askpass-calls");
        let cryptsetup_calls_file = root.join("cryptsetup-calls");

        let attach_helper = write_script(
            root,
            "systemd-cryptsetup",
            &r#"#!/bin/sh
printf '%s\n' "$*" >> @CALLS@
key=$(od -An -v -tx1 < "$4" | tr -d ' \n')
for f in @KEYSLOTS@/*; do
    [ -f "$f" ] || continue
    if [ "$key" = "$(od -An -v -tx1 < "$f" | tr -d ' \n')" ]; then
        exit 0
    fi
done
exit 5
"#
            .replace("@CALLS@", &attach_calls_file.display().to_string())
            .replace("@KEYSLOTS@", &keyslots_dir.display().to_string()),
        );

        let askpass_helper = write_script(
            root,
            "systemd-ask-password",
            &r#"#!/bin/sh
printf '%s\n' "$*" >> @CALLS@
head -n 1 @PASSWORDS@
tail -n +2 @PASSWORDS@ > @PASSWORDS@.tmp && mv @PASSWORDS@.tmp @PASSWORDS@
"#
            .replace("@CALLS@", &askpass_calls_file.display().to_string())
            .replace("@PASSWORDS@", &passwords_file.display().to_string()),
        );

        let cryptsetup_helper = write_script(
            root,
            "cryptsetup",
            &r#"#!/bin/sh
printf '%s\n' "$*" >> @CALLS@
keyfile=
action=
while [ $# -gt 0 ]; do
    case "$1" in
        --key-file)
            keyfile=$2
            shift 2
            ;;
        --type|--cipher|--key-size|--pbkdf|--iter-time|--label|--priority|--key-slot|--luks2-metadata-size|--luks2-keyslots-size)
            shift 2
            ;;
        -*)
            shift
            ;;
        *)
            if [ -z "$action" ]; then
                action=$1
                shift
            else
                break
            fi
            ;;
    esac
done
new_keyfile=
if [ "$action" = luksAddKey ]; then
    new_keyfile=$2
fi
inv=$(find @INVDIR@ -mindepth 1 | wc -l)
inv=$((inv + 1))
: > @INVDIR@/$inv
dump() {
    if [ -z "$1" ]; then
        : > "$2"
    elif [ "$1" = - ]; then
        cat > "$2"
    else
        cat "$1" > "$2"
    fi
}
dump "$keyfile" @ROOT@/key.$inv
dump "$new_keyfile" @ROOT@/newkey.$inv
"#
            .replace("@CALLS@", &cryptsetup_calls_file.display().to_string())
            .replace("@INVDIR@", &cryptsetup_inv_dir.display().to_string())
            .replace("@ROOT@", &root.display().to_string()),
        );

        let paths = HelperPaths {
            systemd_cryptsetup: attach_helper.clone(),
            systemd_ask_password: askpass_helper,
            cryptsetup: cryptsetup_helper,
            run_dir,
        };

        MockHelpers {
            dir,
            keyslots_dir,
            keyslot_count: 0,
            passwords_file,
            attach_calls_file,
            askpass_calls_file,
            cryptsetup_calls_file,
            cryptsetup_inv_dir,
            attach_helper,
            paths,
        }
    }

    /// Adds a key that the mock attach helper will accept.
    pub fn add_keyslot(&mut self, key: &[u8]) {
        fs::write(self.keyslots_dir.join(self.keyslot_count.to_string()), key).unwrap();
        self.keyslot_count += 1;
    }

    /// Queues passphrases for the mock ask-password helper, one per call.
    pub fn set_passphrases(&self, passphrases: &[&str]) {
        let mut contents = passphrases.join("\n");
        contents.push('\n');
        fs::write(&self.passwords_file, contents).unwrap();
    }

    fn read_calls(path: &Path) -> Vec<String> {
        match fs::read_to_string(path) {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Recorded `systemd-cryptsetup` invocations, one argv per entry
    /// (without the program name).
    pub fn attach_calls(&self) -> Vec<Vec<String>> {
        Self::read_calls(&self.attach_calls_file)
            .into_iter()
            .map(|line| line.split(' ').map(str::to_string).collect())
            .collect()
    }

    /// Recorded `systemd-ask-password` invocations as raw argument lines.
    pub fn askpass_calls(&self) -> Vec<String> {
        Self::read_calls(&self.askpass_calls_file)
    }

    /// Recorded `cryptsetup` invocations, one argv per entry.
    pub fn cryptsetup_calls(&self) -> Vec<Vec<String>> {
        Self::read_calls(&self.cryptsetup_calls_file)
            .into_iter()
            .map(|line| line.split(' ').map(str::to_string).collect())
            .collect()
    }

    /// The key the mock `cryptsetup` read via `--key-file` on invocation
    /// `n` (1-based).
    pub fn cryptsetup_key(&self, n: usize) -> Vec<u8> {
        fs::read(self.dir.path().join(format!("key.{}", n))).unwrap()
    }

    /// The new key the mock `cryptsetup` read on invocation `n` (1-based).
    pub fn cryptsetup_newkey(&self, n: usize) -> Vec<u8> {
        fs::read(self.dir.path().join(format!("newkey.{}", n))).unwrap()
    }

    /// Asserts one attach call: `attach <volume> <device> <fifo> <opts>`
    /// with the FIFO under this environment's runtime dir.
    pub fn assert_attach_call(&self, call: &[String], volume: &str, device: &str, opts: &str) {
        assert_eq!(call.len(), 5, "unexpected attach argv: {:?}", call);
        assert_eq!(call[0], "attach");
        assert_eq!(call[1], volume);
        assert_eq!(call[2], device);
        assert!(
            call[3].starts_with(&self.paths.run_dir.display().to_string())
                && call[3].ends_with("/fifo"),
            "unexpected FIFO path: {}",
            call[3]
        );
        assert_eq!(call[4], opts);
    }

    /// Asserts every recorded attach call has the given shape.
    pub fn assert_all_attach_calls(&self, volume: &str, device: &str, opts: &str) {
        for call in self.attach_calls() {
            self.assert_attach_call(&call, volume, device, opts);
        }
    }

    /// Asserts every recorded ask-password call prompts for `device`.
    pub fn assert_all_askpass_calls(&self, device: &str) {
        let expected = format!(
            "--icon drive-harddisk --id {}:{} Please enter the recovery key for disk {}:",
            process_name(),
            device,
            device
        );
        for call in self.askpass_calls() {
            assert_eq!(call, expected);
        }
    }
}

/// Base name of the running test binary, mirroring what the library uses
/// in prompts and keyring descriptions.
pub fn process_name() -> String {
    let arg0 = std::env::args().next().unwrap();
    Path::new(&arg0)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Mock platform handler whose behaviour is scripted by the sealed blob,
/// so concurrently running tests never fight over handler state.
struct MockPlatformHandler;

impl PlatformKeyHandler for MockPlatformHandler {
    fn recover_keys(
        &self,
        data: &KeyData,
    ) -> Result<(DiskUnlockKey, AuxiliaryKey), PlatformHandlerError> {
        let blob: serde_json::Value = serde_json::from_slice(data.sealed_blob())
            .map_err(|e| PlatformHandlerError::InvalidKey(e.to_string()))?;

        let decode = |field: &str| -> Vec<u8> {
            blob[field]
                .as_str()
                .map(|s| STANDARD.decode(s).unwrap())
                .unwrap_or_default()
        };

        match blob["state"].as_str().unwrap_or_default() {
            "ok" => Ok((
                DiskUnlockKey::new(decode("unlock_key")),
                AuxiliaryKey::new(decode("aux_key")),
            )),
            "unavailable" => Err(PlatformHandlerError::Unavailable(
                "the platform device is unavailable".into(),
            )),
            "uninitialized" => Err(PlatformHandlerError::Uninitialized(
                "the platform device is not initialized".into(),
            )),
            "invalid" => Err(PlatformHandlerError::InvalidKey(
                "the sealed blob cannot be decoded".into(),
            )),
            other => Err(PlatformHandlerError::Other(
                format!("unknown mock state {:?}", other).into(),
            )),
        }
    }
}

/// Registers the mock platform handler exactly once per test binary.
pub fn ensure_mock_handler() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        register_platform_key_handler(MOCK_PLATFORM, Arc::new(MockPlatformHandler));
    });
}

fn sealed_blob(state: &str, unlock_key: &[u8], aux_key: &[u8]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "state": state,
        "unlock_key": STANDARD.encode(unlock_key),
        "aux_key": STANDARD.encode(aux_key),
    }))
    .unwrap()
}

/// Builds key data that the mock handler recovers successfully.
pub fn make_key_data(id: KeyId, unlock_key: &[u8], aux_key: &[u8]) -> KeyData {
    ensure_mock_handler();
    KeyData::new(id, MOCK_PLATFORM, sealed_blob("ok", unlock_key, aux_key))
}

/// Builds key data whose recovery fails with the scripted state.
pub fn make_failing_key_data(id: KeyId, state: &str) -> KeyData {
    ensure_mock_handler();
    KeyData::new(id, MOCK_PLATFORM, sealed_blob(state, &[], &[]))
}

/// Asserts the unlock key published for `device` matches, skipping when
/// the user keyring is not reachable from this process.
pub fn check_unlock_key_in_keyring(prefix: &str, device: &str, expected: &[u8]) {
    match get_disk_unlock_key_from_kernel(prefix, device) {
        Ok(key) => assert_eq!(key.as_bytes(), expected),
        Err(e) => eprintln!("skipping unlock-key keyring assertion: {}", e),
    }
}

/// Asserts the auxiliary key published for `device` matches, skipping when
/// the user keyring is not reachable from this process.
pub fn check_aux_key_in_keyring(prefix: &str, device: &str, expected: &[u8]) {
    match get_auxiliary_key_from_kernel(prefix, device) {
        Ok(key) => assert_eq!(key.as_bytes(), expected),
        Err(e) => eprintln!("skipping aux-key keyring assertion: {}", e),
    }
}
