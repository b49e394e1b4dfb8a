use async_trait::async_trait;
use std::io;
use tokio::io::AsyncWriteExt;

use super::{BoxedStream, ClientImpl, DialArgs};
use crate::proxy_dialer::ProxyDialer;

pub struct TcpClientImpl {
    target_address: String,
    proxy: ProxyDialer,
}

impl TcpClientImpl {
    pub fn new(target_address: String, proxy: &str) -> Self {
        Self {
            target_address,
            proxy: ProxyDialer::parse(proxy),
        }
    }
}

#[async_trait]
impl ClientImpl for TcpClientImpl {
    async fn dial(&self, args: DialArgs) -> io::Result<BoxedStream> {
        let mut stream = self.proxy.connect(&self.target_address).await?;
        if !args.early_data.is_empty() {
            stream.write_all(&args.early_data).await?;
        }
        Ok(Box::pin(stream))
    }

    fn target(&self) -> &str {
        &self.target_address
    }

    fn proxy(&self) -> &str {
        self.proxy.raw()
    }
}
