//! Redis 测试容器，需要本地 Docker

use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

pub struct RedisTestContainer {
    _container: ContainerAsync<Redis>,
    url: String,
}

impl RedisTestContainer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let container = Redis::default().with_tag("7-alpine").start().await?;
        let port = container.get_host_port_ipv4(6379).await?;
        Ok(Self {
            _container: container,
            url: format!("redis://127.0.0.1:{port}"),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
