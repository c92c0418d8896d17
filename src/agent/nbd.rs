//! Minimal NBD client: fixed-newstyle negotiation, positional writes, flush
//! and clean disconnect. Exactly what the copy workers need against the
//! orchestrator's nbd-server, nothing more; reads and the option haggling
//! dance are not implemented.

use crate::agent::error::AgentServiceError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// Negotiation constants
const NBDMAGIC: u64 = 0x4e42444d41474943;
const IHAVEOPT: u64 = 0x49484156454F5054;
const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const FLAG_NO_ZEROES: u16 = 1 << 1;
const CLIENT_FLAG_FIXED_NEWSTYLE: u32 = 1 << 0;
const CLIENT_FLAG_NO_ZEROES: u32 = 1 << 1;
const OPT_EXPORT_NAME: u32 = 1;

// Transmission constants
const REQUEST_MAGIC: u32 = 0x25609513;
const REPLY_MAGIC: u32 = 0x67446698;
const CMD_WRITE: u16 = 1;
const CMD_DISC: u16 = 2;
const CMD_FLUSH: u16 = 3;

/// One NBD connection bound to a single export. Each copy worker owns one.
pub struct NbdClient {
    stream: TcpStream,
    export_size: u64,
    next_handle: u64,
}

impl NbdClient {
    /// Dials the data-channel address and negotiates the named export.
    pub async fn connect(
        address: &str,
        export_name: &str,
        timeout: Duration,
    ) -> Result<Self, AgentServiceError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| AgentServiceError::Nbd(format!("connect to {} timed out", address)))??;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream,
            export_size: 0,
            next_handle: 1,
        };
        client.negotiate(export_name).await?;
        Ok(client)
    }

    async fn negotiate(&mut self, export_name: &str) -> Result<(), AgentServiceError> {
        let magic = self.stream.read_u64().await?;
        if magic != NBDMAGIC {
            return Err(AgentServiceError::Nbd(format!(
                "bad server magic {:#x}",
                magic
            )));
        }
        let opt_magic = self.stream.read_u64().await?;
        if opt_magic != IHAVEOPT {
            return Err(AgentServiceError::Nbd("server is oldstyle; fixed-newstyle required".into()));
        }

        let handshake_flags = self.stream.read_u16().await?;
        if handshake_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(AgentServiceError::Nbd("server lacks fixed-newstyle support".into()));
        }
        let no_zeroes = handshake_flags & FLAG_NO_ZEROES != 0;

        let mut client_flags = CLIENT_FLAG_FIXED_NEWSTYLE;
        if no_zeroes {
            client_flags |= CLIENT_FLAG_NO_ZEROES;
        }
        self.stream.write_u32(client_flags).await?;

        // NBD_OPT_EXPORT_NAME moves straight to transmission on success
        self.stream.write_u64(IHAVEOPT).await?;
        self.stream.write_u32(OPT_EXPORT_NAME).await?;
        self.stream.write_u32(export_name.len() as u32).await?;
        self.stream.write_all(export_name.as_bytes()).await?;

        self.export_size = self.stream.read_u64().await?;
        let _transmission_flags = self.stream.read_u16().await?;

        if !no_zeroes {
            let mut padding = [0u8; 124];
            self.stream.read_exact(&mut padding).await?;
        }

        Ok(())
    }

    pub fn export_size(&self) -> u64 {
        self.export_size
    }

    async fn send_request(
        &mut self,
        cmd: u16,
        offset: u64,
        length: u32,
    ) -> Result<u64, AgentServiceError> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);

        self.stream.write_u32(REQUEST_MAGIC).await?;
        self.stream.write_u16(0).await?; // command flags
        self.stream.write_u16(cmd).await?;
        self.stream.write_u64(handle).await?;
        self.stream.write_u64(offset).await?;
        self.stream.write_u32(length).await?;
        Ok(handle)
    }

    async fn read_reply(&mut self, expected_handle: u64) -> Result<(), AgentServiceError> {
        let magic = self.stream.read_u32().await?;
        if magic != REPLY_MAGIC {
            return Err(AgentServiceError::Nbd(format!("bad reply magic {:#x}", magic)));
        }
        let error = self.stream.read_u32().await?;
        let handle = self.stream.read_u64().await?;

        if handle != expected_handle {
            return Err(AgentServiceError::Nbd(format!(
                "reply handle {} does not match request {}",
                handle, expected_handle
            )));
        }
        if error != 0 {
            return Err(AgentServiceError::Nbd(format!("server error {}", error)));
        }
        Ok(())
    }

    /// Positional write. Write order across workers does not affect final
    /// state; every byte lands at its own offset.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), AgentServiceError> {
        if offset + data.len() as u64 > self.export_size {
            return Err(AgentServiceError::Nbd(format!(
                "write of {} bytes at {} exceeds export size {}",
                data.len(),
                offset,
                self.export_size
            )));
        }

        let handle = self.send_request(CMD_WRITE, offset, data.len() as u32).await?;
        self.stream.write_all(data).await?;
        self.read_reply(handle).await
    }

    pub async fn flush(&mut self) -> Result<(), AgentServiceError> {
        let handle = self.send_request(CMD_FLUSH, 0, 0).await?;
        self.read_reply(handle).await
    }

    /// NBD_CMD_DISC has no reply; the server closes after processing.
    pub async fn disconnect(mut self) -> Result<(), AgentServiceError> {
        self.send_request(CMD_DISC, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Speaks just enough server-side NBD to exercise the client: one
    /// export, writes acknowledged, flush acknowledged.
    async fn fake_server(listener: TcpListener, export_size: u64) -> Vec<(u64, Vec<u8>)> {
        let (mut socket, _) = listener.accept().await.unwrap();

        socket.write_u64(NBDMAGIC).await.unwrap();
        socket.write_u64(IHAVEOPT).await.unwrap();
        socket.write_u16(FLAG_FIXED_NEWSTYLE).await.unwrap();

        let _client_flags = socket.read_u32().await.unwrap();
        let _opt_magic = socket.read_u64().await.unwrap();
        let _option = socket.read_u32().await.unwrap();
        let name_len = socket.read_u32().await.unwrap();
        let mut name = vec![0u8; name_len as usize];
        socket.read_exact(&mut name).await.unwrap();

        socket.write_u64(export_size).await.unwrap();
        socket.write_u16(0).await.unwrap();
        socket.write_all(&[0u8; 124]).await.unwrap();

        let mut writes = Vec::new();
        loop {
            let magic = socket.read_u32().await.unwrap();
            assert_eq!(magic, REQUEST_MAGIC);
            let _flags = socket.read_u16().await.unwrap();
            let cmd = socket.read_u16().await.unwrap();
            let handle = socket.read_u64().await.unwrap();
            let offset = socket.read_u64().await.unwrap();
            let length = socket.read_u32().await.unwrap();

            match cmd {
                CMD_WRITE => {
                    let mut data = vec![0u8; length as usize];
                    socket.read_exact(&mut data).await.unwrap();
                    writes.push((offset, data));
                    socket.write_u32(REPLY_MAGIC).await.unwrap();
                    socket.write_u32(0).await.unwrap();
                    socket.write_u64(handle).await.unwrap();
                }
                CMD_FLUSH => {
                    socket.write_u32(REPLY_MAGIC).await.unwrap();
                    socket.write_u32(0).await.unwrap();
                    socket.write_u64(handle).await.unwrap();
                }
                CMD_DISC => return writes,
                other => panic!("unexpected command {}", other),
            }
        }
    }

    #[tokio::test]
    async fn negotiates_writes_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_server(listener, 1 << 30));

        let mut client = NbdClient::connect(&address, "migration-job-disk-2000", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.export_size(), 1 << 30);

        client.write_at(0, b"first").await.unwrap();
        client.write_at(4096, b"second").await.unwrap();
        client.flush().await.unwrap();
        client.disconnect().await.unwrap();

        let writes = server.await.unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], (0, b"first".to_vec()));
        assert_eq!(writes[1], (4096, b"second".to_vec()));
    }

    #[tokio::test]
    async fn write_past_export_end_is_rejected_locally() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_server(listener, 4096));

        let mut client = NbdClient::connect(&address, "x", Duration::from_secs(5))
            .await
            .unwrap();
        let result = client.write_at(4096, b"overflow").await;
        assert!(result.is_err());

        client.disconnect().await.unwrap();
        server.await.unwrap();
    }
}
