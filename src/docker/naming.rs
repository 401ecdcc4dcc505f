use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use super::error::{DockerError, Result};

/// Base-54 alphabet: digits and letters minus the visually ambiguous
/// glyphs `0 1 i I L O l o`, in ASCII order.
const BASE54_ALPHABET: &[u8; 54] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz";

const ALNUM: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Image names repeat across many container launches, so sanitized results
/// are memoized in a small bounded cache.
const NAME_CACHE_CAP: usize = 10;

fn name_cache() -> &'static Mutex<HashMap<(String, Option<usize>), String>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, Option<usize>), String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Derive a valid container-name prefix from an image name.
///
/// Every run of characters outside `[A-Za-z0-9_.-]` collapses to a single
/// `_`. If the result does not start with an alphanumeric character, a
/// deterministic alphanumeric prefix derived from a CRC32 of the original
/// name is prepended, and the result is then truncated to `max_length` by
/// keeping the first character and the last `max_length - 1` characters.
pub fn sanitize_container_name(image_name: &str, max_length: Option<usize>) -> Result<String> {
    let key = (image_name.to_string(), max_length);
    if let Ok(cache) = name_cache().lock()
        && let Some(hit) = cache.get(&key)
    {
        return Ok(hit.clone());
    }

    let mut sanitized = String::with_capacity(image_name.len());
    let mut in_run = false;
    for c in image_name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            sanitized.push(c);
            in_run = false;
        } else if !in_run {
            sanitized.push('_');
            in_run = true;
        }
    }

    if !sanitized.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        let mut crc = flate2::Crc::new();
        crc.update(image_name.as_bytes());
        let prefix = ALNUM[crc.sum() as usize % ALNUM.len()] as char;
        sanitized.insert(0, prefix);

        if let Some(max_length) = max_length {
            if max_length < 2 {
                return Err(DockerError::InvalidArgument(
                    "max_length must be at least 2".into(),
                ));
            }
            if sanitized.len() > max_length {
                let tail_start = sanitized.len() - (max_length - 1);
                sanitized = format!("{}{}", &sanitized[..1], &sanitized[tail_start..]);
            }
        }
    }

    if let Ok(mut cache) = name_cache().lock() {
        if cache.len() >= NAME_CACHE_CAP {
            cache.clear();
        }
        cache.insert(key, sanitized.clone());
    }
    Ok(sanitized)
}

/// Encode a byte string, interpreted as a big-endian unsigned integer, in
/// the 54-symbol alphabet. Empty input encodes to the empty string; a
/// zero-valued input still produces one digit (the alphabet's first
/// character).
pub fn encode_base54(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    let mut digits = bytes.to_vec();
    let mut encoded: Vec<u8> = Vec::new();
    loop {
        // Long division of the big-endian byte string by 54.
        let mut rem: u32 = 0;
        let mut quotient: Vec<u8> = Vec::with_capacity(digits.len());
        for &d in &digits {
            let acc = rem * 256 + u32::from(d);
            let q = (acc / 54) as u8;
            rem = acc % 54;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        encoded.push(BASE54_ALPHABET[rem as usize]);
        if quotient.is_empty() {
            break;
        }
        digits = quotient;
    }

    encoded.iter().rev().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_clean_names_through() {
        assert_eq!(
            sanitize_container_name("python-dev", None).unwrap(),
            "python-dev"
        );
        let name = "foo-bar.baz_123";
        assert_eq!(sanitize_container_name(name, None).unwrap(), name);
    }

    #[test]
    fn sanitize_replaces_disallowed_chars() {
        assert_eq!(
            sanitize_container_name("mysql:5.7", None).unwrap(),
            "mysql_5.7"
        );
        assert_eq!(
            sanitize_container_name("archivebox/archivebox:latest", None).unwrap(),
            "archivebox_archivebox_latest"
        );
        assert_eq!(
            sanitize_container_name("my image@2", None).unwrap(),
            "my_image_2"
        );
    }

    #[test]
    fn sanitize_collapses_runs_of_disallowed_chars() {
        assert_eq!(sanitize_container_name("a!!b", None).unwrap(), "a_b");
    }

    #[test]
    fn sanitize_output_is_a_valid_container_name() {
        for name in ["mysql:5.7", "$weird", ":::", "a b c", "@tag/img:1"] {
            let out = sanitize_container_name(name, None).unwrap();
            let mut chars = out.chars();
            assert!(chars.next().unwrap().is_ascii_alphanumeric(), "{out}");
            assert!(
                chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')),
                "{out}"
            );
        }
    }

    #[test]
    fn sanitize_is_stable_across_calls() {
        let a = sanitize_container_name("$$$strange$$$", None).unwrap();
        let b = sanitize_container_name("$$$strange$$$", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sanitize_truncates_hashed_names_to_max_length() {
        let result = sanitize_container_name(".name$with%spcl!chars", Some(10)).unwrap();
        assert_eq!(result.len(), 10);
        assert!(result.chars().next().unwrap().is_ascii_alphanumeric());
        // First char is the hash-derived prefix; the rest is the name's tail.
        assert_eq!(&result[1..], "pcl_chars");
    }

    #[test]
    fn sanitize_rejects_max_length_below_two() {
        let err = sanitize_container_name("$$$", Some(1)).unwrap_err();
        assert!(matches!(err, DockerError::InvalidArgument(_)));
    }

    #[test]
    fn base54_of_empty_is_empty() {
        assert_eq!(encode_base54(b""), "");
    }

    #[test]
    fn base54_of_zero_is_first_alphabet_char() {
        assert_eq!(encode_base54(b"\x00"), "2");
        assert_eq!(encode_base54(b"\x00\x00"), "2");
    }

    #[test]
    fn base54_known_vector() {
        let input = [
            119u8, 126, 125, 254, 23, 144, 58, 210, 3, 213, 212, 168, 27, 97, 108, 210,
        ];
        assert_eq!(encode_base54(&input), "3EBJn55PNpUTnjjJAGRKar2");
    }

    #[test]
    fn base54_single_bytes_round_trip() {
        // Injective over fixed-length inputs: decode back to the integer.
        let decode = |s: &str| -> u64 {
            s.bytes().fold(0u64, |acc, b| {
                let idx = BASE54_ALPHABET.iter().position(|&a| a == b).unwrap();
                acc * 54 + idx as u64
            })
        };
        for value in [0u8, 1, 53, 54, 55, 200, 255] {
            assert_eq!(decode(&encode_base54(&[value])), u64::from(value));
        }
        assert_eq!(decode(&encode_base54(&[1, 0])), 256);
        assert_eq!(decode(&encode_base54(&[255, 255])), 65535);
    }
}
