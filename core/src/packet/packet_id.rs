// Packet ids: unique per exchange, optionally `queue:index`

/// A fresh random packet id.
pub fn unique() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Id of item `index` of message queue `queue`.
pub fn composite(queue: &str, index: u64) -> String {
    format!("{}:{}", queue, index)
}

/// Split a composite id into queue and index.
pub fn split(packet_id: &str) -> Option<(&str, u64)> {
    let (queue, index) = packet_id.rsplit_once(':')?;
    if queue.is_empty() {
        return None;
    }
    Some((queue, index.parse().ok()?))
}
