//! Entities shared by unit tests.

use crate::mapping::{Entity, EntityDescriptor};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: Option<i64>,
    pub user_name: Option<String>,
    pub pass_word: Option<String>,
    pub gender_type: Option<i64>,
    pub login_count: Option<i64>,
    pub login_ip: Option<String>,
    pub is_locked: Option<bool>,
    pub get_date: Option<String>,
}

impl User {
    pub fn sample() -> Self {
        Self {
            id: None,
            user_name: Some("admin".to_string()),
            pass_word: Some("secret".to_string()),
            gender_type: Some(1),
            login_count: Some(3),
            ..Self::default()
        }
    }
}

impl Entity for User {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("Members_User")
            .key("ID", |u| u.id.map(Value::from))
            .field("UserName", |u| u.user_name.clone().map(Value::from))
            .field("PassWord", |u| u.pass_word.clone().map(Value::from))
            .field("GenderType", |u| u.gender_type.map(Value::from))
            .field("LoginCount", |u| u.login_count.map(Value::from))
            .field("LoginIP", |u| u.login_ip.clone().map(Value::from))
            .field("IsLocked", |u| u.is_locked.map(Value::from))
            .column("GetDate", "getdate()", |u| u.get_date.clone().map(Value::from))
            .transient("Remark")
            .related_set("Orders")
    }
}
