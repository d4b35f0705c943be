use redis::aio::ConnectionManager;

/// User↔socket and user→rooms mappings in the shared store. Each mutation is
/// a single pipeline so concurrent binds on different nodes cannot interleave
/// halfway.
pub struct SessionRegistry {
    redis: ConnectionManager,
}

fn user_sockets_key(user: &str) -> String {
    format!("user:sockets:{user}")
}

fn socket_user_key(socket: &str) -> String {
    format!("socket:user:{socket}")
}

fn user_rooms_key(user: &str) -> String {
    format!("user:rooms:{user}")
}

impl SessionRegistry {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Bind `socket` as the user's single live socket. Returns the socket ids
    /// that were evicted so the caller can disconnect them through the
    /// cluster adapter.
    pub async fn bind(&self, user: &str, socket: &str) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        let existing: Vec<String> = redis::cmd("SMEMBERS")
            .arg(user_sockets_key(user))
            .query_async(&mut conn)
            .await?;

        let stale: Vec<String> = existing.into_iter().filter(|s| s != socket).collect();

        let mut pipe = redis::pipe();
        for old in &stale {
            pipe.cmd("SREM")
                .arg(user_sockets_key(user))
                .arg(old)
                .ignore()
                .cmd("DEL")
                .arg(socket_user_key(old))
                .ignore();
        }
        pipe.cmd("SADD")
            .arg(user_sockets_key(user))
            .arg(socket)
            .ignore()
            .cmd("SET")
            .arg(socket_user_key(socket))
            .arg(user)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(stale)
    }

    /// Drop one socket's mappings. Returns the user it belonged to, if any.
    pub async fn unbind(&self, socket: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        let user: Option<String> = redis::cmd("GET")
            .arg(socket_user_key(socket))
            .query_async(&mut conn)
            .await?;

        let Some(user) = user else {
            return Ok(None);
        };

        redis::pipe()
            .cmd("SREM")
            .arg(user_sockets_key(&user))
            .arg(socket)
            .ignore()
            .cmd("DEL")
            .arg(socket_user_key(socket))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(Some(user))
    }

    pub async fn add_rooms(&self, user: &str, rooms: &[String]) -> Result<(), redis::RedisError> {
        if rooms.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SADD");
        cmd.arg(user_rooms_key(user));
        for room in rooms {
            cmd.arg(room);
        }
        cmd.query_async::<()>(&mut conn).await
    }

    pub async fn rooms_of(&self, user: &str) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        redis::cmd("SMEMBERS")
            .arg(user_rooms_key(user))
            .query_async(&mut conn)
            .await
    }

    pub async fn user_of(&self, socket: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        redis::cmd("GET")
            .arg(socket_user_key(socket))
            .query_async(&mut conn)
            .await
    }

    pub async fn sockets_of(&self, user: &str) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.redis.clone();
        redis::cmd("SMEMBERS")
            .arg(user_sockets_key(user))
            .query_async(&mut conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_store_layout() {
        assert_eq!(user_sockets_key("u1"), "user:sockets:u1");
        assert_eq!(socket_user_key("s1"), "socket:user:s1");
        assert_eq!(user_rooms_key("u1"), "user:rooms:u1");
    }
}
