// Copyright (c) 2024-2025 The TezSign Foundation

//! encdec helper modules shared by the frame and rpc codecs

/// encdec helper for fixed byte arrays (pending const-generic impls
/// upstream)
pub(crate) mod arr {
    use encdec::Error;

    pub fn enc<const N: usize>(d: &[u8; N], buff: &mut [u8]) -> Result<usize, Error> {
        if buff.len() < d.len() {
            return Err(Error::Length);
        }

        buff[..d.len()].copy_from_slice(&d[..]);

        Ok(d.len())
    }

    pub fn enc_len<const N: usize>(d: &[u8; N]) -> Result<usize, Error> {
        Ok(d.len())
    }

    pub fn dec<const N: usize>(buff: &[u8]) -> Result<([u8; N], usize), Error> {
        if buff.len() < N {
            return Err(Error::Length);
        }

        let mut d = [0u8; N];
        d.copy_from_slice(&buff[..N]);

        Ok((d, N))
    }
}

/// encdec helper module for the lock-state byte
pub(crate) mod lock_state {
    use crate::rpc::{LockState, RpcError};

    pub fn enc(s: &LockState, buff: &mut [u8]) -> Result<usize, RpcError> {
        if buff.is_empty() {
            return Err(RpcError::Truncated);
        }

        buff[0] = *s as u8;

        Ok(1)
    }

    pub fn enc_len(_s: &LockState) -> Result<usize, RpcError> {
        Ok(1)
    }

    pub fn dec(buff: &[u8]) -> Result<(LockState, usize), RpcError> {
        let b = buff.first().ok_or(RpcError::Truncated)?;

        Ok((LockState::from_wire(*b)?, 1))
    }
}

/// encdec helper module for the per-kind watermark triple
pub(crate) mod wm_arr {
    use encdec::{Decode, Encode};

    use crate::rpc::{RpcError, Watermark};

    pub fn enc(wms: &[Watermark; 3], buff: &mut [u8]) -> Result<usize, RpcError> {
        let mut index = 0;
        for wm in wms {
            index += wm.encode(&mut buff[index..])?;
        }

        Ok(index)
    }

    pub fn enc_len(wms: &[Watermark; 3]) -> Result<usize, RpcError> {
        let mut len = 0;
        for wm in wms {
            len += wm.encode_len()?;
        }

        Ok(len)
    }

    pub fn dec(buff: &[u8]) -> Result<([Watermark; 3], usize), RpcError> {
        let mut index = 0;
        let mut wms = [Watermark::default(); 3];
        for wm in wms.iter_mut() {
            let (w, n) = Watermark::decode(&buff[index..])?;
            *wm = w;
            index += n;
        }

        Ok((wms, index))
    }
}
