use nalgebra::Vector3;

/// Completes a unit `axis` to an orthonormal triad, returning the two unit
/// vectors perpendicular to it.
///
/// The pivot is chosen away from the dominant component so the construction
/// stays well conditioned for every input direction.
pub fn orthonormal_basis(axis: &Vector3<f64>) -> [Vector3<f64>; 2] {
    let p0 = if axis[0].abs() > axis[1].abs() {
        let inv_len = 1.0 / (axis[0] * axis[0] + axis[2] * axis[2]).sqrt();
        Vector3::new(-axis[2] * inv_len, 0.0, axis[0] * inv_len)
    } else {
        let inv_len = 1.0 / (axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
        Vector3::new(0.0, axis[2] * inv_len, -axis[1] * inv_len)
    };
    let p1 = axis.cross(&p0);
    [p0, p1]
}
