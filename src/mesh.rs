use glam::Vec3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(
            Self {
                min: first,
                max: first,
            },
            |aabb, p| Self {
                min: aabb.min.min(p),
                max: aabb.max.max(p),
            },
        ))
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Component-wise scale. Negative factors swap the corresponding min/max.
    pub fn scaled(&self, scale: Vec3) -> Self {
        let (a, b) = (self.min * scale, self.max * scale);
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }
}

/// Vertex data of the mesh a blueprint is generated from.
#[derive(Clone, Debug, Default)]
pub struct InputMesh {
    pub vertices: Vec<Vec3>,
    /// Per-vertex normals. May be shorter than `vertices`; missing entries read as zero.
    pub normals: Vec<Vec3>,
    /// Mirrors the host's CPU-readable flag. Unreadable meshes can't be sampled.
    pub readable: bool,
}

impl InputMesh {
    pub fn new(vertices: Vec<Vec3>, normals: Vec<Vec3>) -> Self {
        Self {
            vertices,
            normals,
            readable: true,
        }
    }

    pub fn normal(&self, vertex: usize) -> Vec3 {
        self.normals.get(vertex).copied().unwrap_or(Vec3::ZERO)
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices.iter().copied())
    }
}
