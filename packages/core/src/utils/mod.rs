// Вспомогательные функции

pub mod serialization;
pub mod time;
pub mod validation;
