//! Inertia tensors for common solid shapes.
//!
//! Every shape comes in two flavours: `*_mass` takes the total mass,
//! `*_density` derives it from the volume. Tensors are expressed in the body
//! frame about the centre of mass.

use std::f64::consts::PI;

use super::states::{NMat3, NVec3};

/// Solid sphere of total `mass`
pub fn sphere_inertia_mass(mass: f64, radius: f64) -> NMat3 {
    let i = 0.4 * mass * radius * radius;
    NMat3::from_diagonal_element(i)
}

/// Solid sphere of uniform `density`
pub fn sphere_inertia_density(density: f64, radius: f64) -> NMat3 {
    sphere_inertia_mass(density * sphere_volume(radius), radius)
}

/// Rectangular block with edge lengths `x`, `y`, `z`
pub fn block_inertia_mass(mass: f64, x: f64, y: f64, z: f64) -> NMat3 {
    let k = mass / 12.0;
    NMat3::from_diagonal(&NVec3::new(
        k * (y * y + z * z),
        k * (x * x + z * z),
        k * (x * x + y * y),
    ))
}

pub fn block_inertia_density(density: f64, x: f64, y: f64, z: f64) -> NMat3 {
    block_inertia_mass(density * x * y * z, x, y, z)
}

pub fn cube_inertia_mass(mass: f64, side: f64) -> NMat3 {
    block_inertia_mass(mass, side, side, side)
}

pub fn cube_inertia_density(density: f64, side: f64) -> NMat3 {
    block_inertia_density(density, side, side, side)
}

/// Solid cylinder whose axis is the body Y axis
pub fn cylinder_inertia_mass(mass: f64, radius: f64, height: f64) -> NMat3 {
    let axial = 0.5 * mass * radius * radius;
    let transverse = mass * (3.0 * radius * radius + height * height) / 12.0;
    NMat3::from_diagonal(&NVec3::new(transverse, axial, transverse))
}

pub fn cylinder_inertia_density(density: f64, radius: f64, height: f64) -> NMat3 {
    cylinder_inertia_mass(density * PI * radius * radius * height, radius, height)
}

pub fn sphere_volume(radius: f64) -> f64 {
    4.0 / 3.0 * PI * radius * radius * radius
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cube_is_isotropic() {
        let i = cube_inertia_mass(6.0, 1.0);
        assert_relative_eq!(i[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(i[(1, 1)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(i[(2, 2)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn density_variants_agree_with_mass_variants() {
        let r = 0.3;
        let m = 1000.0 * sphere_volume(r);
        assert_relative_eq!(sphere_inertia_density(1000.0, r), sphere_inertia_mass(m, r), epsilon = 1e-9);

        let b = block_inertia_density(1000.0, 0.1, 0.1, 1.0);
        assert_relative_eq!(b, block_inertia_mass(10.0, 0.1, 0.1, 1.0), epsilon = 1e-9);
    }

    #[test]
    fn cylinder_axis_is_y() {
        let i = cylinder_inertia_mass(2.0, 0.5, 0.1);
        assert_relative_eq!(i[(1, 1)], 0.25, epsilon = 1e-12);
        assert!(i[(0, 0)] < i[(1, 1)]);
    }
}
