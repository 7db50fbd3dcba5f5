use strum::{Display, EnumString};

/// Which kind of entity owns a ledger row (§4.3). Stored as the `scope`
/// column alongside `entity_id` so one ledger table can serve projects,
/// scenes, characters, and locations without four near-identical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Scope {
    Project,
    Scene,
    Character,
    Location,
}
