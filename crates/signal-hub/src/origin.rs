pub trait OriginPolicy: Send + Sync {
    fn allows(&self, origin: Option<&str>) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl OriginPolicy for AllowAll {
    fn allows(&self, _origin: Option<&str>) -> bool {
        true
    }
}

/// Exact, case-insensitive origin match. Requests without an `Origin` header
/// are refused.
#[derive(Debug, Clone)]
pub struct AllowList {
    origins: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            origins: origins
                .into_iter()
                .map(|origin| normalize(origin.as_ref()))
                .filter(|origin| !origin.is_empty())
                .collect(),
        }
    }
}

impl OriginPolicy for AllowList {
    fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return false;
        };
        let origin = normalize(origin);
        self.origins.iter().any(|allowed| *allowed == origin)
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_lowercase()
}
