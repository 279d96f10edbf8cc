use std::io::Cursor;
use std::sync::Arc;

use hdk_npdrm::{LicenseType, NpdrmKeys, rap_to_klicensee};
use hdk_secure::EcdsaKeypair;

use crate::image::IMAGE_FOOTER;
use crate::{
    CancelToken, CodecOptions, CodecState, ContainerReader, CryptoError, FormatError, KeyError,
    KeyTable, KeyTableEntry, PlainImage, SceError, Segment, SegmentFlag, SelfType, content_id,
    decrypt, encrypt, report_metadata,
};

const CONTENT: &str = "UP0001-TEST00001_00-0000000000000001";

fn npdrm_keys() -> NpdrmKeys {
    NpdrmKeys {
        klic_free: [0x11; 16],
        klic_key: [0x12; 16],
        rif_key: [0x13; 16],
        idps_const: [0x14; 16],
        rap_init_key: [0x15; 16],
        rap_pbox: [
            0x0C, 0x03, 0x06, 0x04, 0x01, 0x0B, 0x0F, 0x08, 0x02, 0x07, 0x00, 0x05, 0x0A, 0x0E,
            0x0D, 0x09,
        ],
        rap_e1: [0x16; 16],
        rap_e2: [0x17; 16],
    }
}

fn entry(category: SelfType, revision: u16, scalar: u8, can_sign: bool) -> KeyTableEntry {
    let keypair = EcdsaKeypair::from_private([scalar; 24]).unwrap();
    KeyTableEntry {
        category,
        revision,
        erk: [scalar ^ 0x5A; 32],
        riv: [scalar ^ 0xA5; 16],
        public_key: *keypair.public_key(),
        private_key: can_sign.then_some([scalar; 24]),
    }
}

/// Test keys. In production these come from a keys file.
fn test_keys() -> KeyTable {
    KeyTable::new()
        .with_entry(entry(SelfType::App, 1, 0x22, true))
        .with_entry(entry(SelfType::Npdrm, 1, 0x33, true))
        .with_npdrm_keys(npdrm_keys())
}

fn sample_image() -> PlainImage {
    PlainImage {
        auth_id: 0x1010_0000_0100_0003,
        vendor_id: 0x0100_0002,
        app_version: 0x0001_0000_0000_0000,
        segments: vec![
            Segment {
                kind: 1,
                flags: SegmentFlag::Compressed.into(),
                data: b"code segment ".repeat(200),
            },
            Segment {
                kind: 2,
                flags: SegmentFlag::Unencrypted.into(),
                data: (0..=255u8).collect(),
            },
            Segment {
                kind: 2,
                flags: Default::default(),
                data: b"encrypted data segment".to_vec(),
            },
        ],
    }
}

fn disc_options() -> CodecOptions {
    CodecOptions::builder()
        .disc_encryption(true)
        .key_revision(1u16)
        .build()
        .unwrap()
}

fn encrypt_with(image: &PlainImage, keys: &KeyTable, options: &CodecOptions) -> Vec<u8> {
    let plain = image.to_bytes().unwrap();
    let mut out = Vec::new();
    encrypt(Cursor::new(plain), &mut out, keys, options).unwrap();
    out
}

fn decrypt_to_vec(
    container: &[u8],
    keys: &KeyTable,
    options: &CodecOptions,
) -> (Result<crate::CodecReport, crate::CodecFailure>, Vec<u8>) {
    let mut out = Vec::new();
    let result = decrypt(Cursor::new(container), &mut out, keys, options);
    (result, out)
}

fn section_offset(container: &[u8], index: usize) -> usize {
    let reader = ContainerReader::open(Cursor::new(container)).unwrap();
    reader.container().sections[index].offset as usize
}

#[test]
fn disc_round_trip() {
    let keys = test_keys();
    let image = sample_image();
    let container = encrypt_with(&image, &keys, &disc_options());

    // The encrypted segments must not be visible in the container.
    assert!(
        !container
            .windows(22)
            .any(|w| w == b"encrypted data segment")
    );

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    let report = result.unwrap();
    assert_eq!(report.state, CodecState::Done);
    assert_eq!(report.sections, 3);
    assert!(report.signature_verified);
    assert!(!report.npdrm);
    assert_eq!(out, image.to_bytes().unwrap());
}

#[test]
fn debug_round_trip() {
    let keys = test_keys();
    let options = CodecOptions {
        debug: true,
        ..disc_options()
    };
    let container = encrypt_with(&sample_image(), &keys, &options);

    let summary = report_metadata(Cursor::new(&container)).unwrap();
    assert!(summary.debug);
    assert_eq!(summary.key_revision, 1);

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    result.unwrap();
    assert_eq!(out, sample_image().to_bytes().unwrap());
}

#[test]
fn empty_image_round_trip() {
    let keys = test_keys();
    let image = PlainImage {
        segments: Vec::new(),
        ..sample_image()
    };
    let container = encrypt_with(&image, &keys, &disc_options());

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    assert_eq!(result.unwrap().sections, 0);
    assert_eq!(out, image.to_bytes().unwrap());
}

#[test]
fn tampered_section_fails_integrity() {
    let keys = test_keys();
    let mut container = encrypt_with(&sample_image(), &keys, &disc_options());
    let offset = section_offset(&container, 2);
    container[offset + 3] ^= 0x80;

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    let failure = result.unwrap_err();
    assert!(matches!(
        failure.error,
        SceError::Crypto(CryptoError::IntegrityMismatch(2))
    ));
    assert_eq!(failure.stage, CodecState::KeyResolved);
    assert!(failure.output_incomplete);
    assert!(!out.ends_with(&IMAGE_FOOTER));
}

#[test]
fn tampered_header_fails_signature() {
    let keys = test_keys();
    let mut container = encrypt_with(&sample_image(), &keys, &disc_options());
    // Low byte of the auth id in the app info.
    container[0x57] ^= 0x01;

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    let failure = result.unwrap_err();
    assert!(matches!(
        failure.error,
        SceError::Crypto(CryptoError::BadSignature)
    ));
    assert!(!failure.output_incomplete);
    assert!(out.is_empty());

    let unchecked = CodecOptions {
        verify_signature: false,
        ..CodecOptions::default()
    };
    let (result, out) = decrypt_to_vec(&container, &keys, &unchecked);
    assert!(!result.unwrap().signature_verified);
    let image = PlainImage::parse(&out).unwrap();
    assert_eq!(image.auth_id, sample_image().auth_id ^ 0x01);
}

#[test]
fn unknown_revision_is_a_key_error() {
    let keys = test_keys();
    let container = encrypt_with(&sample_image(), &keys, &disc_options());

    let other = KeyTable::new().with_entry(entry(SelfType::App, 2, 0x22, true));
    let (result, out) = decrypt_to_vec(&container, &other, &CodecOptions::default());
    let failure = result.unwrap_err();
    assert!(matches!(
        failure.error,
        SceError::Key(KeyError::UnknownRevision { revision: 1, .. })
    ));
    assert_eq!(failure.stage, CodecState::HeaderParsed);
    assert!(out.is_empty());
}

#[test]
fn wrong_key_fails() {
    let keys = test_keys();
    let container = encrypt_with(&sample_image(), &keys, &disc_options());

    let other = KeyTable::new().with_entry(entry(SelfType::App, 1, 0x44, true));
    let (result, _) = decrypt_to_vec(&container, &other, &CodecOptions::default());
    assert!(result.is_err());
}

#[test]
fn metadata_report_needs_no_keys() {
    let keys = test_keys();
    let options = CodecOptions::builder()
        .npdrm_encryption(true)
        .content_id(CONTENT)
        .license_type(LicenseType::Free)
        .app_type(2u32)
        .key_revision(1u16)
        .build()
        .unwrap();
    let container = encrypt_with(&sample_image(), &keys, &options);

    let first = report_metadata(Cursor::new(&container)).unwrap();
    let second = report_metadata(Cursor::new(&container)).unwrap();
    assert_eq!(first, second);

    assert_eq!(first.self_type, Some(SelfType::Npdrm));
    assert_eq!(first.section_count, 3);
    assert_eq!(first.auth_id, sample_image().auth_id);
    assert_eq!(first.license_type, Some(LicenseType::Free));
    assert_eq!(first.app_type, Some(2));
    assert_eq!(
        first.content_id.and_then(|id| id.as_str().map(str::to_string)),
        Some(CONTENT.to_string())
    );
    assert!(first.to_string().contains(CONTENT));

    let id = content_id(Cursor::new(&container)).unwrap().unwrap();
    assert_eq!(id.as_str(), Some(CONTENT));
}

#[test]
fn disc_container_has_no_content_id() {
    let keys = test_keys();
    let container = encrypt_with(&sample_image(), &keys, &disc_options());
    assert!(content_id(Cursor::new(&container)).unwrap().is_none());
}

#[test]
fn concurrent_decrypts_share_keys() {
    let keys = Arc::new(test_keys());
    let npdrm = CodecOptions::builder()
        .npdrm_encryption(true)
        .content_id(CONTENT)
        .key_revision(1u16)
        .build()
        .unwrap();

    let containers: Vec<Vec<u8>> = (0..4u8)
        .map(|n| {
            let mut image = sample_image();
            for segment in &mut image.segments {
                segment.data.iter_mut().for_each(|b| *b = b.wrapping_add(n));
                segment.data.extend(std::iter::repeat_n(n, usize::from(n) * 16));
            }
            let options = if n % 2 == 0 { disc_options() } else { npdrm.clone() };
            encrypt_with(&image, &keys, &options)
        })
        .collect();

    let expected: Vec<Vec<u8>> = containers
        .iter()
        .map(|container| {
            let (result, out) = decrypt_to_vec(container, &keys, &CodecOptions::default());
            result.unwrap();
            out
        })
        .collect();
    for (i, a) in expected.iter().enumerate() {
        assert!(expected[i + 1..].iter().all(|b| a != b));
    }

    let handles: Vec<_> = containers
        .into_iter()
        .map(|container| {
            let keys = Arc::clone(&keys);
            std::thread::spawn(move || {
                let mut out = Vec::new();
                let report = decrypt(
                    Cursor::new(container.as_slice()),
                    &mut out,
                    keys.as_ref(),
                    &CodecOptions::default(),
                )
                .unwrap();
                (report.npdrm, out)
            })
        })
        .collect();

    for (n, (handle, expected)) in handles.into_iter().zip(expected).enumerate() {
        let (npdrm, out) = handle.join().unwrap();
        assert_eq!(npdrm, n % 2 == 1, "container {n}");
        assert_eq!(out, expected, "container {n}");
    }
}

#[test]
fn npdrm_free_round_trip() {
    let keys = test_keys();
    let options = CodecOptions::builder()
        .npdrm_encryption(true)
        .content_id(CONTENT)
        .key_revision(1u16)
        .build()
        .unwrap();
    let container = encrypt_with(&sample_image(), &keys, &options);

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    assert!(result.unwrap().npdrm);
    assert_eq!(out, sample_image().to_bytes().unwrap());

    // A free container still needs the NPDRM constants.
    let no_npdrm = KeyTable::new().with_entry(entry(SelfType::Npdrm, 1, 0x33, true));
    let (result, _) = decrypt_to_vec(&container, &no_npdrm, &CodecOptions::default());
    assert!(matches!(
        result.unwrap_err().error,
        SceError::Key(KeyError::MissingNpdrmKeys)
    ));
}

#[test]
fn npdrm_local_needs_license() {
    let keys = test_keys();
    let klicensee = [0x5Du8; 16];
    let options = CodecOptions::builder()
        .npdrm_encryption(true)
        .content_id(CONTENT)
        .license_type(LicenseType::Local)
        .klicensee(klicensee)
        .key_revision(1u16)
        .build()
        .unwrap();
    let container = encrypt_with(&sample_image(), &keys, &options);

    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    let failure = result.unwrap_err();
    assert!(matches!(
        failure.error,
        SceError::Key(KeyError::MissingLicense(_))
    ));
    assert!(out.is_empty());

    let with_license = CodecOptions::builder().klicensee(klicensee).build().unwrap();
    let (result, out) = decrypt_to_vec(&container, &keys, &with_license);
    result.unwrap();
    assert_eq!(out, sample_image().to_bytes().unwrap());

    let wrong_license = CodecOptions::builder().klicensee([0u8; 16]).build().unwrap();
    let (result, _) = decrypt_to_vec(&container, &keys, &wrong_license);
    assert!(result.is_err());
}

#[test]
fn npdrm_rap_round_trip() {
    let keys = test_keys();
    let rap = [0xA7u8; 16];
    let klicensee = rap_to_klicensee(&rap, &npdrm_keys()).unwrap();

    let options = CodecOptions::builder()
        .npdrm_encryption(true)
        .content_id(CONTENT)
        .license_type(LicenseType::Network)
        .klicensee(*klicensee.as_bytes())
        .key_revision(1u16)
        .build()
        .unwrap();
    let container = encrypt_with(&sample_image(), &keys, &options);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(format!("{CONTENT}.rap")), rap).unwrap();

    let decrypt_options = CodecOptions::builder()
        .rap_directory(dir.path())
        .build()
        .unwrap();
    let (result, out) = decrypt_to_vec(&container, &keys, &decrypt_options);
    result.unwrap();
    assert_eq!(out, sample_image().to_bytes().unwrap());
}

#[test]
fn content_id_option_must_match_container() {
    let keys = test_keys();
    let options = CodecOptions::builder()
        .npdrm_encryption(true)
        .content_id(CONTENT)
        .key_revision(1u16)
        .build()
        .unwrap();
    let container = encrypt_with(&sample_image(), &keys, &options);

    let other = CodecOptions::builder()
        .content_id("EP0002-OTHER0000_00-0000000000000002")
        .build()
        .unwrap();
    let (result, _) = decrypt_to_vec(&container, &keys, &other);
    assert!(matches!(
        result.unwrap_err().error,
        SceError::Key(KeyError::LicenseMismatch { .. })
    ));
}

#[test]
fn npdrm_encrypt_needs_content_id() {
    let keys = test_keys();
    let options = CodecOptions::builder()
        .npdrm_encryption(true)
        .key_revision(1u16)
        .build()
        .unwrap();

    let mut out = Vec::new();
    let failure = encrypt(
        Cursor::new(sample_image().to_bytes().unwrap()),
        &mut out,
        &keys,
        &options,
    )
    .unwrap_err();
    assert!(matches!(failure.error, SceError::Options(_)));
    assert_eq!(failure.stage, CodecState::HeaderParsed);
    assert!(out.is_empty());
}

#[test]
fn cancelled_decrypt_stops_between_sections() {
    let keys = test_keys();
    let container = encrypt_with(&sample_image(), &keys, &disc_options());

    let token = CancelToken::new();
    token.cancel();
    let options = CodecOptions::builder().cancel(token).build().unwrap();

    let (result, out) = decrypt_to_vec(&container, &keys, &options);
    let failure = result.unwrap_err();
    assert!(matches!(failure.error, SceError::Cancelled));
    assert_eq!(failure.stage, CodecState::KeyResolved);
    assert!(failure.output_incomplete);
    assert!(!out.ends_with(&IMAGE_FOOTER));
}

#[test]
fn cancelled_encrypt_writes_nothing() {
    let keys = test_keys();
    let token = CancelToken::new();
    token.cancel();
    let options = CodecOptions {
        cancel: Some(token),
        ..disc_options()
    };

    let mut out = Vec::new();
    let failure = encrypt(
        Cursor::new(sample_image().to_bytes().unwrap()),
        &mut out,
        &keys,
        &options,
    )
    .unwrap_err();
    assert!(matches!(failure.error, SceError::Cancelled));
    assert!(!failure.output_incomplete);
    assert!(out.is_empty());
}

#[test]
fn unfinalized_image_is_refused() {
    let keys = test_keys();
    let mut plain = sample_image().to_bytes().unwrap();
    plain.truncate(plain.len() - IMAGE_FOOTER.len());

    let mut out = Vec::new();
    let failure = encrypt(Cursor::new(plain), &mut out, &keys, &disc_options()).unwrap_err();
    assert!(matches!(
        failure.error,
        SceError::Format(FormatError::Unfinalized)
    ));
    assert_eq!(failure.stage, CodecState::Init);
    assert!(out.is_empty());
}

#[test]
fn truncated_container_is_rejected() {
    let keys = test_keys();
    let container = encrypt_with(&sample_image(), &keys, &disc_options());

    for len in [0, 0x10, 0x40, container.len() / 2] {
        let (result, out) = decrypt_to_vec(&container[..len], &keys, &CodecOptions::default());
        let failure = result.unwrap_err();
        assert!(matches!(failure.error, SceError::Format(_)), "length {len:#X}");
        assert_eq!(failure.stage, CodecState::Init);
        assert!(out.is_empty());
    }
}

#[test]
fn encrypt_needs_signing_key() {
    let keys = KeyTable::new().with_entry(entry(SelfType::App, 1, 0x22, false));

    let mut out = Vec::new();
    let failure = encrypt(
        Cursor::new(sample_image().to_bytes().unwrap()),
        &mut out,
        &keys,
        &disc_options(),
    )
    .unwrap_err();
    assert!(matches!(
        failure.error,
        SceError::Key(KeyError::MissingSigningKey { revision: 1, .. })
    ));
    assert!(out.is_empty());
}

#[test]
fn conflicting_modes_are_rejected() {
    let keys = test_keys();
    let options = CodecOptions {
        npdrm_encryption: true,
        ..disc_options()
    };

    let mut out = Vec::new();
    let failure = encrypt(
        Cursor::new(sample_image().to_bytes().unwrap()),
        &mut out,
        &keys,
        &options,
    )
    .unwrap_err();
    assert!(matches!(failure.error, SceError::Options(_)));
    assert_eq!(failure.stage, CodecState::Init);
}

#[test]
fn disc_encrypt_rejects_npdrm_category() {
    let keys = test_keys();
    let options = CodecOptions {
        self_type: Some(SelfType::Npdrm),
        ..disc_options()
    };

    let mut out = Vec::new();
    let failure = encrypt(
        Cursor::new(sample_image().to_bytes().unwrap()),
        &mut out,
        &keys,
        &options,
    )
    .unwrap_err();
    assert!(matches!(failure.error, SceError::Options(_)));
    assert_eq!(failure.stage, CodecState::Init);
    assert!(out.is_empty());

    // Without a mode flag the category override is honoured.
    let options = CodecOptions {
        disc_encryption: false,
        ..options
    };
    let container = encrypt_with(&sample_image(), &keys, &options);
    let summary = report_metadata(Cursor::new(&container)).unwrap();
    assert_eq!(summary.self_type, Some(SelfType::Npdrm));
}

#[test]
fn keys_file_drives_round_trip() {
    let keypair = EcdsaKeypair::from_private([0x22; 24]).unwrap();
    let text = format!(
        "; test keys\n[app-0001]\ntype=SELF\nself_type=APP\nrevision=0001\nerk={}\nriv={}\npub={}\npriv={}\n",
        hex::encode([0x78u8; 32]),
        hex::encode([0x87u8; 16]),
        hex::encode(keypair.public_key().to_bytes()),
        hex::encode([0x22u8; 24]),
    );
    let keys = KeyTable::from_keys_file(&text).unwrap();
    assert_eq!(keys.len(), 1);

    let container = encrypt_with(&sample_image(), &keys, &disc_options());
    let (result, out) = decrypt_to_vec(&container, &keys, &CodecOptions::default());
    result.unwrap();
    assert_eq!(out, sample_image().to_bytes().unwrap());
}
