/// Error type shared by every operation of the data-access core.
#[derive(Debug)]
pub enum NebulaError {
    /// A predicate or call received malformed arguments.
    QueryArgument(String),
    /// A relation name is not registered on the entity type, or the relation
    /// does not support the requested operation.
    RelationshipConfig { entity: String, relation: String },
    /// A "fail if missing" lookup found no row.
    EntityNotFound { entity: String, key: String },
    /// Database configuration could not be read.
    Config(String),
    /// The driver rejected a statement.
    Driver {
        statement: String,
        source: sqlx::Error,
    },
}

impl NebulaError {
    pub(crate) fn argument(message: impl Into<String>) -> Self {
        Self::QueryArgument(message.into())
    }

    pub(crate) fn relationship(entity: &str, relation: &str) -> Self {
        Self::RelationshipConfig {
            entity: entity.to_owned(),
            relation: relation.to_owned(),
        }
    }

    pub(crate) fn driver(statement: &str, source: sqlx::Error) -> Self {
        Self::Driver {
            statement: statement.to_owned(),
            source,
        }
    }

    /// Returns `true` for [`NebulaError::EntityNotFound`].
    ///
    /// Callers usually turn this into a 404-style response instead of
    /// reporting it as a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }
}

impl std::fmt::Display for NebulaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryArgument(message) => write!(f, "invalid query argument: {}", message),
            Self::RelationshipConfig { entity, relation } => {
                write!(f, "relationship `{}` is not defined on {}", relation, entity)
            }
            Self::EntityNotFound { entity, key } => {
                write!(f, "no {} found for key {}", entity, key)
            }
            Self::Config(message) => write!(f, "invalid database configuration: {}", message),
            Self::Driver { statement, source } if statement.is_empty() => {
                write!(f, "statement failed: {}", source)
            }
            Self::Driver { statement, source } => {
                write!(f, "statement failed: {} ({})", source, statement)
            }
        }
    }
}

impl std::error::Error for NebulaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Driver { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Wraps a driver error raised outside a known statement, such as a pool
/// checkout on a caller's own sqlx code.
impl From<sqlx::Error> for NebulaError {
    fn from(source: sqlx::Error) -> Self {
        Self::Driver {
            statement: String::new(),
            source,
        }
    }
}

/// Result alias for Nebula operations.
pub type NebulaResult<T> = Result<T, NebulaError>;
