use std::fs;
use std::path::Path;

use keyward::{
    EncryptionAlgorithm, EncryptionService, Error, KdfParams, KeyProtection, KeyPurpose, Metadata,
    ServiceConfig,
};
use tempfile::tempdir;
use zeroize::Zeroizing;

fn open(dir: &Path) -> EncryptionService {
    EncryptionService::open(ServiceConfig::new(dir), KeyProtection::Unprotected).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7919) >> 3) as u8).collect()
}

#[test]
fn every_algorithm_roundtrips() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());

    for algorithm in EncryptionAlgorithm::ALL {
        for len in [0, 1, 1024 * 1024 + 3] {
            let data = payload(len);
            let result = svc
                .encrypt_data_with(&data, Some(algorithm), Metadata::new())
                .unwrap();
            assert_eq!(result.algorithm, algorithm);
            assert_eq!(result.iv_or_nonce.len(), algorithm.nonce_len());
            assert_eq!(result.tag.len(), algorithm.tag_len());

            let opened = svc.decrypt_data(&result).unwrap();
            assert!(opened.verified, "{algorithm} len {len}");
            assert_eq!(opened.plaintext.as_slice(), data.as_slice(), "{algorithm} len {len}");
        }
    }
}

#[test]
fn empty_gcm_payload() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());

    let result = svc
        .encrypt_data_with(b"", Some(EncryptionAlgorithm::Aes256Gcm), Metadata::new())
        .unwrap();
    assert!(result.ciphertext.is_empty());
    assert_eq!(result.tag.len(), 16);

    let opened = svc.decrypt_data(&result).unwrap();
    assert!(opened.verified);
    assert!(opened.plaintext.is_empty());
}

#[test]
fn flipped_bits_are_detected_for_aead() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());
    let data = payload(64);

    for algorithm in [EncryptionAlgorithm::Aes256Gcm, EncryptionAlgorithm::ChaCha20Poly1305] {
        let result = svc
            .encrypt_data_with(&data, Some(algorithm), Metadata::new())
            .unwrap();

        for byte in [0, 31, 63] {
            for bit in [0, 7] {
                let mut tampered = result.clone();
                tampered.ciphertext[byte] ^= 1 << bit;

                let opened = svc.decrypt_data(&tampered).unwrap();
                assert!(!opened.verified, "{algorithm} byte {byte} bit {bit}");
                assert!(opened.plaintext.is_empty());
            }
        }

        let mut tampered = result.clone();
        tampered.iv_or_nonce[0] ^= 1;
        assert!(!svc.decrypt_data(&tampered).unwrap().verified);
    }
}

#[test]
fn ciphertext_does_not_open_under_another_store() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let a = open(dir_a.path());
    let b = open(dir_b.path());

    let result = a.encrypt_data(b"isolated").unwrap();

    // same id, different key bytes
    let key_b = b.key_store().get_active_key(KeyPurpose::Encryption).unwrap();
    let cipher = key_b.cipher(result.algorithm).unwrap();
    let opened = cipher.open(
        &result.iv_or_nonce,
        &result.ciphertext,
        &result.tag,
        result.key_id.as_bytes(),
    );
    assert!(matches!(opened, Err(Error::AuthenticationFailure)));

    // b has never seen a's key
    assert!(matches!(b.decrypt_data(&result), Err(Error::KeyNotFound(_))));
}

#[test]
fn cbc_under_the_wrong_key_never_yields_the_plaintext() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());
    let result = svc
        .encrypt_data_with(b"cbc secret payload", Some(EncryptionAlgorithm::Aes256Cbc), Metadata::new())
        .unwrap();

    let other = svc.key_store().rotate_key(KeyPurpose::Encryption).unwrap();
    let mut moved = result.clone();
    moved.key_id = other.key_id().to_string();

    let opened = svc.decrypt_data(&moved).unwrap();
    assert_ne!(opened.plaintext.as_slice(), b"cbc secret payload");
}

#[test]
fn rotation_keeps_old_ciphertexts_readable() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());

    let before = svc.encrypt_data(b"written with k1").unwrap();
    assert!(svc.rotate_encryption_key());
    let after = svc.encrypt_data(b"written with k2").unwrap();

    assert_ne!(before.key_id, after.key_id);
    assert_eq!(
        svc.key_store().get_active_key(KeyPurpose::Encryption).unwrap().key_id(),
        after.key_id
    );

    let old = svc.decrypt_data(&before).unwrap();
    assert!(old.verified);
    assert_eq!(old.plaintext.as_slice(), b"written with k1");
}

#[test]
fn deactivated_keys_still_decrypt() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());

    let result = svc.encrypt_data(b"archived").unwrap();
    assert!(svc.deactivate_key(&result.key_id).unwrap());

    assert_eq!(svc.decrypt_data(&result).unwrap().plaintext.as_slice(), b"archived");
}

#[test]
fn reopen_preserves_keys() {
    let dir = tempdir().unwrap();

    let (result, keys) = {
        let svc = open(dir.path());
        svc.rotate_encryption_key();
        (svc.encrypt_data(b"survives restart").unwrap(), svc.key_store().keys())
    };

    let svc = open(dir.path());
    let reopened = svc.key_store().keys();
    assert_eq!(reopened.len(), keys.len());

    for (before, after) in keys.iter().zip(&reopened) {
        assert_eq!(before.key_id(), after.key_id());
        assert_eq!(before.key_bytes(), after.key_bytes());
        assert_eq!(before.algorithm(), after.algorithm());
        assert_eq!(before.is_active(), after.is_active());
    }

    assert_eq!(svc.decrypt_data(&result).unwrap().plaintext.as_slice(), b"survives restart");
}

#[test]
fn passphrase_protected_service_reopens() {
    let dir = tempdir().unwrap();
    let protection = || KeyProtection::Passphrase {
        passphrase: Zeroizing::new("correct horse".to_string()),
        kdf: KdfParams::new(1024, 1, 1).unwrap(),
    };

    let result = {
        let svc = EncryptionService::open(ServiceConfig::new(dir.path()), protection()).unwrap();
        svc.encrypt_data(b"wrapped at rest").unwrap()
    };

    for entry in fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|ext| ext == "key") {
            assert!(fs::read_to_string(path).unwrap().contains("\"scheme\": \"wrapped\""));
        }
    }

    let svc = EncryptionService::open(ServiceConfig::new(dir.path()), protection()).unwrap();
    assert_eq!(svc.decrypt_data(&result).unwrap().plaintext.as_slice(), b"wrapped at rest");

    assert!(EncryptionService::open(ServiceConfig::new(dir.path()), KeyProtection::Unprotected).is_err());
}

#[test]
fn multi_megabyte_file_roundtrip() {
    let dir = tempdir().unwrap();
    let svc = open(&dir.path().join("keys"));

    let input = dir.path().join("blob.bin");
    let data = payload(3 * 1024 * 1024 + 12345);
    fs::write(&input, &data).unwrap();

    let encrypted = svc.encrypt_file(&input, None).unwrap().unwrap();
    let restored = dir.path().join("restored.bin");
    svc.decrypt_file(&encrypted, Some(restored.as_path())).unwrap();

    assert_eq!(fs::read(restored).unwrap(), data);
}

#[test]
fn chacha_files_roundtrip() {
    let dir = tempdir().unwrap();
    let mut config = ServiceConfig::new(dir.path().join("keys"));
    config.default_algorithm = EncryptionAlgorithm::ChaCha20Poly1305;
    config.chunk_size = 1000;
    let svc = EncryptionService::open(config, KeyProtection::Unprotected).unwrap();

    for len in [0, 999, 1000, 1001, 5000] {
        let input = dir.path().join(format!("in-{len}.bin"));
        fs::write(&input, payload(len)).unwrap();

        let encrypted = svc.encrypt_file(&input, None).unwrap().unwrap();
        let decrypted = svc.decrypt_file(&encrypted, None).unwrap().unwrap();
        assert_eq!(fs::read(decrypted).unwrap(), payload(len), "len {len}");
    }
}

#[test]
fn corrupted_chunk_fails_whole_file() {
    let dir = tempdir().unwrap();
    let svc = open(&dir.path().join("keys"));

    let input = dir.path().join("blob.bin");
    fs::write(&input, payload(2 * 1024 * 1024)).unwrap();
    let encrypted = svc.encrypt_file(&input, None).unwrap().unwrap();

    // header is 5 + 1 + 4 + 1 + 12 + 1 + key id; each full record is
    // 1 + 4 + 64 KiB + 16 bytes
    let key = svc.key_store().get_active_key(KeyPurpose::Encryption).unwrap();
    let header_len = 24 + key.key_id().len();
    let record_len = 1 + 4 + 64 * 1024 + 16;

    let mut bytes = fs::read(&encrypted).unwrap();
    bytes[header_len + 3 * record_len - 1] ^= 0xFF;
    fs::write(&encrypted, bytes).unwrap();

    let output = dir.path().join("blob.out");
    let err = svc.decrypt_file(&encrypted, Some(output.as_path())).unwrap_err();

    assert!(matches!(err, Error::ChunkAuthentication { index: 2 }));
    assert!(!output.exists());
    assert_eq!(svc.get_encryption_stats().failed_operations, 1);
}

#[test]
fn existing_output_survives_failed_decryption() {
    let dir = tempdir().unwrap();
    let svc = open(&dir.path().join("keys"));

    let input = dir.path().join("doc.txt");
    fs::write(&input, b"contents").unwrap();
    let encrypted = svc.encrypt_file(&input, None).unwrap().unwrap();

    let mut bytes = fs::read(&encrypted).unwrap();
    bytes.truncate(bytes.len() - 4);
    fs::write(&encrypted, bytes).unwrap();

    let output = dir.path().join("doc.out");
    fs::write(&output, b"previous").unwrap();

    assert!(matches!(
        svc.decrypt_file(&encrypted, Some(output.as_path())),
        Err(Error::MalformedEnvelope(_))
    ));
    assert_eq!(fs::read(&output).unwrap(), b"previous");
}

#[test]
fn stats_are_monotonic_under_concurrency() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());

    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let svc = &svc;
            scope.spawn(move || {
                let mut last = 0;
                for i in 0..PER_THREAD {
                    let result = svc.encrypt_data(format!("{t}-{i}").as_bytes()).unwrap();
                    assert!(svc.decrypt_data(&result).unwrap().verified);

                    let seen = svc.get_encryption_stats().encryption_operations;
                    assert!(seen >= last);
                    last = seen;
                }
            });
        }
    });

    let stats = svc.get_encryption_stats();
    assert_eq!(stats.encryption_operations, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.decryption_operations, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.failed_operations, 0);
}

#[test]
fn rotation_during_concurrent_encryption() {
    let dir = tempdir().unwrap();
    let svc = open(dir.path());

    let results = std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            (0..100)
                .map(|i| svc.encrypt_data(format!("msg {i}").as_bytes()).unwrap())
                .collect::<Vec<_>>()
        });
        for _ in 0..5 {
            assert!(svc.rotate_encryption_key());
        }
        writer.join().unwrap()
    });

    assert_eq!(svc.key_store().active_key_count(), 2);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(
            svc.decrypt_data(result).unwrap().plaintext.as_slice(),
            format!("msg {i}").as_bytes()
        );
    }
}
