use ::aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytebuffer::ByteBuffer;
use rand::{self, Rng};
use tokio::io::{self, AsyncRead, AsyncReadExt, Error, ErrorKind};

use crate::config::Secret;

type Aes128CbcEnc = cbc::Encryptor<::aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<::aes::Aes128>;

pub type IV = [u8; 16];

const MAGIC: u64 = 0x20240828;
const HEADER_LEN: usize = 16;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const NOISE_MIN: usize = 100;
const NOISE_MAX: usize = 1000;

/// Largest plaintext sealed into one frame. Longer writes are split.
pub const MAX_PLAINTEXT: usize = 16 * 1024;

const MAX_FRAME: usize = HEADER_LEN + IV_LEN + NOISE_MAX + MAX_PLAINTEXT + BLOCK_LEN;

/// AES-128-CBC sealing of stream chunks into self-delimiting frames.
///
/// Frame layout, lengths big endian and masked with `MAGIC`:
///
/// ```text
/// total_len: u64 | noise_len: u64 | iv: [u8; 16] | noise | ciphertext
/// ```
///
/// `total_len` counts every byte of the frame including both length fields.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 16],
}

impl Cipher {
    pub fn new(secret: &Secret) -> Self {
        Self { key: *secret.key() }
    }

    pub fn encrypt(&self, iv: &IV, data: &[u8]) -> Vec<u8> {
        let enc = Aes128CbcEnc::new((&self.key).into(), iv.into());

        let mut buf = vec![0; data.len() + BLOCK_LEN];
        let enc_len = match enc.encrypt_padded_b2b_mut::<Pkcs7>(data, &mut buf) {
            Ok(out) => out.len(),
            // The output buffer always has room for one padding block.
            Err(_) => unreachable!("pkcs7 output buffer too small"),
        };
        buf.truncate(enc_len);
        buf
    }

    pub fn decrypt(&self, iv: &IV, data: &mut [u8]) -> io::Result<Vec<u8>> {
        let dec = Aes128CbcDec::new((&self.key).into(), iv.into());
        dec.decrypt_padded_mut::<Pkcs7>(data)
            .map(|plain| plain.to_vec())
            .map_err(|_| Error::new(ErrorKind::InvalidData, "bad padding in sealed frame"))
    }

    /// Encrypt `data` into one frame with a fresh IV and random noise.
    pub fn seal(&self, data: &[u8]) -> Vec<u8> {
        let (iv, noise) = {
            let mut rng = rand::thread_rng();
            let mut iv = [0u8; IV_LEN];
            rng.fill(&mut iv[..]);
            let mut noise = vec![0; rng.gen_range(NOISE_MIN..NOISE_MAX)];
            rng.fill(&mut noise[..]);
            (iv, noise)
        };
        let body = self.encrypt(&iv, data);

        let noise_len = noise.len() as u64;
        let total_len = (HEADER_LEN + IV_LEN + noise.len() + body.len()) as u64;

        let mut block = ByteBuffer::new();
        block.write_u64(total_len ^ MAGIC);
        block.write_u64(noise_len ^ MAGIC);
        block.write_bytes(&iv);
        block.write_bytes(&noise);
        block.write_bytes(&body);
        block.into_vec()
    }

    /// Read exactly one sealed frame from `reader` and return its plaintext.
    pub async fn open<T>(&self, reader: &mut T) -> io::Result<Vec<u8>>
    where
        T: AsyncRead + Unpin,
    {
        let total_len = (reader.read_u64().await? ^ MAGIC) as usize;
        let noise_len = (reader.read_u64().await? ^ MAGIC) as usize;

        if total_len > MAX_FRAME || noise_len > NOISE_MAX {
            return Err(Error::new(ErrorKind::InvalidData, "sealed frame too large"));
        }
        let rest = total_len
            .checked_sub(HEADER_LEN + IV_LEN + noise_len)
            .filter(|body| *body >= BLOCK_LEN && *body % BLOCK_LEN == 0)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "malformed sealed frame"))?;

        let mut iv = [0u8; IV_LEN];
        reader.read_exact(&mut iv).await?;

        let mut temp = vec![0; noise_len + rest];
        reader.read_exact(&mut temp).await?;
        self.decrypt(&iv, &mut temp[noise_len..])
    }
}
