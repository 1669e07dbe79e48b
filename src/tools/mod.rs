pub mod party_quest;
pub mod r#trait;
pub mod worker;
