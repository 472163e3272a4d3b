//! Per-connection encryption layer. A passive-opened connection generates an
//! RSA key pair and asks the peer to start crypto; the active side wraps a
//! fresh AES-256 key with the received public key and both sides then encrypt
//! package bodies block-by-block in place.

use std::collections::VecDeque;

use plinth::crypto::{
    aes_cipher_length, generate_rsa_key_pair, AesBlockCipher, AesKey, RsaPrivateKey, RsaPublicKey,
    AES_BLOCK_SIZE,
};

use crate::connection::OpenType;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::package::{Package, PackageHeader, HEADER_LEN};
use crate::schema::builtin;
use crate::PackageId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CryptoState {
    Starting,
    Started,
}

/// Outcome of feeding a handshake package into the channel.
pub enum HandshakeStep {
    /// Client side: the wrapped key must go back to the peer, raw.
    Reply(Package),
    /// Server side: the key is installed, nothing to send.
    Started,
    /// Not a handshake package for the current state; dropped.
    Ignored,
}

pub struct SecureChannel {
    state: CryptoState,
    private_key: Option<RsaPrivateKey>,
    key: Option<AesKey>,
    pending: VecDeque<PackageId>,
}

impl SecureChannel {
    /// Channel for an active-opened connection; waits for the peer's
    /// `REQ_START_CRYPTO`.
    pub fn new_active() -> SecureChannel {
        SecureChannel {
            state: CryptoState::Starting,
            private_key: None,
            key: None,
            pending: VecDeque::new(),
        }
    }

    /// Channel for a passive-opened connection. Generates the key pair and
    /// returns the `REQ_START_CRYPTO` package carrying the public key; the
    /// private key is retained until the wrapped AES key arrives.
    pub fn new_passive(net: &Network) -> Result<(SecureChannel, Package)> {
        let pair = generate_rsa_key_pair().map_err(|_| Error::Decrypt)?;
        let der = pair.public.to_der().map_err(|_| Error::Decrypt)?;

        let package = net.store().register(der.len() as i32)?;
        package.update_header(|header| header.command = builtin::REQ_START_CRYPTO);
        package.write_content(&der);

        let channel = SecureChannel {
            state: CryptoState::Starting,
            private_key: Some(pair.private),
            key: None,
            pending: VecDeque::new(),
        };

        Ok((channel, package))
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.state == CryptoState::Started
    }

    /// Queues a package submitted before the key exchange finished.
    #[inline]
    pub fn push_pending(&mut self, package_id: PackageId) {
        self.pending.push_back(package_id);
    }

    /// Drains the queue of packages held back during the key exchange.
    #[inline]
    pub fn take_pending(&mut self) -> Vec<PackageId> {
        self.pending.drain(..).collect()
    }

    /// Advances the key exchange with an inbound package.
    pub fn on_handshake_package(
        &mut self,
        net: &Network,
        open_type: OpenType,
        header: &PackageHeader,
        body: &[u8],
    ) -> Result<HandshakeStep> {
        match (open_type, header.command) {
            (OpenType::Passive, builtin::RSP_START_CRYPTO) => {
                let private_key = self.private_key.take().ok_or(Error::Decrypt)?;
                let plain = private_key.decrypt(body).map_err(|_| Error::Decrypt)?;
                let key = AesKey::from_slice(&plain).map_err(|_| Error::Decrypt)?;

                // The private key was moved out above and drops here; only
                // the symmetric key survives.
                self.key = Some(key);
                self.state = CryptoState::Started;

                Ok(HandshakeStep::Started)
            }
            (OpenType::Active, builtin::REQ_START_CRYPTO) => {
                let public_key = RsaPublicKey::from_der(body).map_err(|_| Error::Decrypt)?;

                let key = AesKey::random();
                let cipher = public_key.encrypt(key.as_bytes()).map_err(|_| Error::Decrypt)?;

                let package = net.store().register(cipher.len() as i32)?;
                package.update_header(|h| h.command = builtin::RSP_START_CRYPTO);
                package.write_content(&cipher);

                self.key = Some(key);
                self.state = CryptoState::Started;

                Ok(HandshakeStep::Reply(package))
            }
            _ => Ok(HandshakeStep::Ignored),
        }
    }

    /// On-wire body length for a plaintext of `content_length` bytes given
    /// the current channel state. Handshake packages travel unpadded.
    pub fn wire_body_length(&self, content_length: usize) -> usize {
        match self.state {
            CryptoState::Started => aes_cipher_length(content_length),
            CryptoState::Starting => content_length,
        }
    }

    /// Encrypts the package body in place. The buffer was allocated with
    /// space for the padded form; padding bytes are the allocation's zeros.
    pub fn encrypt_in_place(&self, package: &Package) -> Result<()> {
        let key = self.key.as_ref().ok_or(Error::Decrypt)?;
        let cipher = AesBlockCipher::new(key);

        let content_length = package.header().content_length as usize;
        let cipher_length = aes_cipher_length(content_length);

        package.with_buf_mut(|buf| {
            cipher.encrypt_blocks(&mut buf[HEADER_LEN..HEADER_LEN + cipher_length]);
        });
        package.set_is_cipher(true);

        Ok(())
    }

    /// Decrypts a received body into a freshly allocated package, header
    /// copied verbatim. `cipher_body` length is the padded wire length.
    pub fn decrypt_package(
        &self,
        net: &Network,
        header: &PackageHeader,
        cipher_body: &[u8],
    ) -> Result<Package> {
        let key = self.key.as_ref().ok_or(Error::Decrypt)?;
        if cipher_body.len() % AES_BLOCK_SIZE != 0 {
            return Err(Error::Decrypt);
        }

        let package = net.store().register(header.content_length)?;
        package.set_header(header);

        let cipher = AesBlockCipher::new(key);
        package.with_buf_mut(|buf| {
            let body = &mut buf[HEADER_LEN..HEADER_LEN + cipher_body.len()];
            body.copy_from_slice(cipher_body);
            cipher.decrypt_blocks(body);
        });

        Ok(package)
    }
}
