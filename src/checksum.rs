//! CRC64/NVME checksums and combining part checksums into a whole-object checksum.
//!

use crate::error::Error::ParseError;
use crate::error::Result;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use crc64fast_nvme::Digest;

/// The reflected CRC-64/NVME polynomial.
const POLY: u64 = 0x9a6c_9329_ac4b_c9b5;

/// Calculate the CRC64/NVME of a buffer.
pub fn crc64(data: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(data);
    digest.sum64()
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for (square, row) in square.iter_mut().zip(mat) {
        *square = gf2_matrix_times(mat, *row);
    }
}

/// Combine the checksum of a first block with the checksum of a following block of `len2`
/// bytes, giving the checksum of both blocks concatenated.
pub fn combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64];
    let mut odd = [0u64; 64];

    // Operator for a single zero bit.
    odd[0] = POLY;
    let mut row = 1;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }

    // Two zero bits, then four.
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    // Apply zero bytes to crc1, the first square gives an operator for one zero byte.
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

/// Fold ordered `(crc64, size)` pairs into the checksum of the whole object. An empty
/// iterator gives the checksum of an empty object.
pub fn combine_parts<I>(parts: I) -> u64
where
    I: IntoIterator<Item = (u64, u64)>,
{
    parts
        .into_iter()
        .fold(0, |crc, (part_crc, size)| combine(crc, part_crc, size))
}

/// Encode a checksum the way S3 represents it, as base64 of the big-endian bytes.
pub fn encode_crc64(crc: u64) -> String {
    BASE64_STANDARD.encode(crc.to_be_bytes())
}

/// Decode a base64 encoded S3 checksum.
pub fn decode_crc64(encoded: &str) -> Result<u64> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|err| ParseError(err.to_string()))?;
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ParseError(format!("{encoded} is not a 64-bit checksum")))?;

    Ok(u64::from_be_bytes(bytes))
}
