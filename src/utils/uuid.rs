use uuid::Uuid;

/// A random v4 uuid without dashes, used as a session id.
pub fn get_uuidv4() -> String {
    Uuid::new_v4().to_simple().to_string()
}
