// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use anyhow::{bail, Context, Result};
use clap::Parser;
use p384::ecdsa::signature::hazmat::PrehashSigner;
use p384::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha384};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use sbrom::bsp::AddressSize;
use sbrom::km::{Algo, KeyId, KeyRecord, KEY_SIZE_BITS};
use sbrom::slbv::{
    SecureHeader, ADDRESS_FIELD_SIZE, APPLI_TYPE_REGULAR, MAGIC_WORD1, MAGIC_WORD2,
    ONE_SIGNATURE, SECURE_HEADER_SIZE, SIGNED_HEADER_SIZE, TWO_SIGNATURES,
};

#[derive(Debug, Parser)]
enum Xtask {
    /// Builds the ROM for one board
    Build {
        #[clap(long)]
        board: String,
        #[clap(long)]
        release: bool,
    },
    /// Wraps a loader binary in a signed secure header, ready for boot flash
    SignImage {
        /// Private scalar, 96 hex digits
        #[clap(long)]
        key: PathBuf,
        /// Second signer, appended after the body
        #[clap(long)]
        second_key: Option<PathBuf>,
        #[clap(long, default_value = "csk", value_parser = parse_key_id)]
        key_id: KeyId,
        #[clap(long, default_value = "psk", value_parser = parse_key_id)]
        second_key_id: KeyId,
        #[clap(long)]
        binary: PathBuf,
        /// Where the ROM copies the binary; omit to run in place
        #[clap(long, value_parser = parse_addr)]
        copy_address: Option<u64>,
        #[clap(long, value_parser = parse_addr)]
        exec_address: u64,
        #[clap(long, default_value_t = 1)]
        firmware_version: u32,
        #[clap(long, default_value_t = sbrom::SBR_REF_VERSION)]
        rom_ref_version: u32,
        #[clap(long)]
        out: PathBuf,
    },
    /// Certifies a public key, as sent with WriteCuk, WriteCsk and WritePsk
    KeyRecord {
        #[clap(long)]
        signer: PathBuf,
        #[clap(long, value_parser = parse_key_id)]
        signer_id: KeyId,
        /// Private scalar of the key being certified, in hex
        #[clap(long)]
        subject: PathBuf,
        #[clap(long)]
        out: PathBuf,
    },
}

fn parse_key_id(s: &str) -> Result<KeyId, String> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "stk" => KeyId::Stk,
        "ssk" => KeyId::Ssk,
        "cuk" => KeyId::Cuk,
        "psk" => KeyId::Psk,
        "csk" => KeyId::Csk,
        _ => return Err(format!("unknown key {s}")),
    })
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s).replace('_', "");
    u64::from_str_radix(&digits, 16).map_err(|e| format!("{s}: {e}"))
}

// borrowed from hubris
fn remap_paths() -> Result<BTreeMap<PathBuf, &'static str>> {
    // Panic messages in crates have a long prefix; we'll shorten it using
    // the --remap-path-prefix argument to reduce message size. We'll remap
    // local crates to /sbrom and crates.io to /crates.io.
    let mut remap_paths = BTreeMap::new();

    if let Ok(home) = std::env::var("CARGO_HOME") {
        let cargo_home = PathBuf::from(home);
        let cargo_git = cargo_home.join("git").join("checkouts");
        remap_paths.insert(cargo_git, "/git");

        let registry = cargo_home.join("registry").join("src");
        remap_paths.insert(registry.join("github.com-1ecc6299db9ec823"), "/crates.io");
        remap_paths.insert(
            registry.join("index.crates.io-6f17d22bba15001f"),
            "/crates.io",
        );
    }

    if let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let mut sbrom_dir = PathBuf::from(dir);
        sbrom_dir.pop();
        remap_paths.insert(sbrom_dir, "/sbrom");
    }
    Ok(remap_paths)
}

fn build(board: String, release: bool) -> Result<()> {
    let target_flags = match board.as_str() {
        "unmatched" => "",
        // The VC707 core has no compressed instructions.
        "vc707" => " -C target-feature=-c",
        _ => bail!("unknown board {board}"),
    };
    let rustflags = remap_paths()?
        .iter()
        .fold(target_flags.to_string(), |mut output, r| {
            let _ = write!(output, " --remap-path-prefix={}={}", r.0.display(), r.1);
            output
        });

    let cargo = std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
    let mut command = Command::new(cargo);
    command.arg("build");
    command.args(["--bin", "sbrom"]);
    command.args(["--target", "riscv64imac-unknown-none-elf"]);
    if release {
        command.arg("--release");
    }
    command.arg("--no-default-features");
    command.arg("--features");
    command.arg(format!("target-board-{}", board));
    command.env("RUSTFLAGS", rustflags);

    let status = command
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?
        .wait()?;
    if !status.success() {
        bail!("build failed: {}", status);
    }
    Ok(())
}

fn load_key(path: &Path) -> Result<SigningKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let scalar = hex::decode(text.trim())
        .with_context(|| format!("{}: expected a hex private scalar", path.display()))?;
    SigningKey::from_bytes(&scalar)
        .map_err(|_| anyhow::anyhow!("{}: not a P-384 key", path.display()))
}

/// R‖S over the SHA-384 of the concatenated parts.
fn sign(key: &SigningKey, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut hasher = Sha384::new();
    for part in parts {
        hasher.update(part);
    }
    let sig: Signature = key
        .sign_prehash(&hasher.finalize())
        .map_err(|e| anyhow::anyhow!("signing: {e}"))?;
    let (r, s) = sig.split_bytes();
    Ok([r.as_slice(), s.as_slice()].concat())
}

fn public_xy(key: &SigningKey) -> Result<sbrom::crypto::PublicKey> {
    let point = key.verifying_key().to_encoded_point(false);
    let (Some(x), Some(y)) = (point.x(), point.y()) else {
        bail!("key has no affine coordinates");
    };
    let mut xy = [0; 96];
    xy[..48].copy_from_slice(x);
    xy[48..].copy_from_slice(y);
    Ok(sbrom::crypto::PublicKey::from_xy(&xy))
}

fn address_field(addr: Option<u64>) -> [u8; ADDRESS_FIELD_SIZE] {
    let mut field = [0; ADDRESS_FIELD_SIZE];
    match addr {
        Some(addr) => field[..8].copy_from_slice(&addr.to_le_bytes()),
        None => field[..8].fill(0xff),
    }
    field
}

#[allow(clippy::too_many_arguments)]
fn sign_image(
    key: PathBuf,
    second_key: Option<PathBuf>,
    key_id: KeyId,
    second_key_id: KeyId,
    binary: PathBuf,
    copy_address: Option<u64>,
    exec_address: u64,
    firmware_version: u32,
    rom_ref_version: u32,
    out: PathBuf,
) -> Result<()> {
    let first = load_key(&key)?;
    let second = second_key.as_deref().map(load_key).transpose()?;
    let body = std::fs::read(&binary).with_context(|| format!("reading {}", binary.display()))?;

    let trailer = if second.is_some() { 96 } else { 0 };
    let image_size = u32::try_from(SECURE_HEADER_SIZE + body.len() + trailer)?;

    let mut header = SecureHeader::new_zeroed();
    header.magic_word1 = U32::new(MAGIC_WORD1);
    header.magic_word2 = U32::new(MAGIC_WORD2);
    header.rom_ref_version = U32::new(rom_ref_version);
    header.firmware_version = U32::new(firmware_version);
    header.appli_type = U16::new(APPLI_TYPE_REGULAR);
    header.address_size = U16::new(AddressSize::Bits64 as u16);
    header.image_size = U32::new(image_size);
    header.firmware_start_offset = U32::new(0);
    header.copy_address = address_field(copy_address);
    header.execution_address = address_field(Some(exec_address));
    header.algo = Algo::Ecdsa384 as u8;
    header.sign_keyid_1 = key_id as u8;
    header.signature_size_bits = U16::new(KEY_SIZE_BITS);
    if second.is_some() {
        header.nb_signatures = TWO_SIGNATURES;
        header.sign_keyid_2 = second_key_id as u8;
    } else {
        header.nb_signatures = ONE_SIGNATURE;
        header.sign_keyid_2 = KeyId::NoKey as u8;
    }

    let signed = header.as_bytes()[..SIGNED_HEADER_SIZE].to_vec();
    header
        .signature
        .copy_from_slice(&sign(&first, &[&signed, &body])?);

    let mut image = header.as_bytes().to_vec();
    image.extend_from_slice(&body);
    if let Some(second) = &second {
        image.extend_from_slice(&sign(second, &[&signed, &body])?);
    }
    std::fs::write(&out, image)?;
    println!("{}: {} bytes", out.display(), image_size);
    Ok(())
}

fn key_record(signer: PathBuf, signer_id: KeyId, subject: PathBuf, out: PathBuf) -> Result<()> {
    let signer = load_key(&signer)?;
    let subject = load_key(&subject)?;
    let mut record = KeyRecord::new(signer_id, &public_xy(&subject)?);
    let certificate = sign(&signer, &[record.signed_prefix()])?;
    record.certificate.copy_from_slice(&certificate);
    std::fs::write(out, record.as_bytes())?;
    Ok(())
}

fn main() -> Result<()> {
    let xtask = Xtask::parse();

    match xtask {
        Xtask::Build { board, release } => {
            build(board, release)?;
        }
        Xtask::SignImage {
            key,
            second_key,
            key_id,
            second_key_id,
            binary,
            copy_address,
            exec_address,
            firmware_version,
            rom_ref_version,
            out,
        } => {
            sign_image(
                key,
                second_key,
                key_id,
                second_key_id,
                binary,
                copy_address,
                exec_address,
                firmware_version,
                rom_ref_version,
                out,
            )?;
        }
        Xtask::KeyRecord {
            signer,
            signer_id,
            subject,
            out,
        } => {
            key_record(signer, signer_id, subject, out)?;
        }
    }
    Ok(())
}
