//! Algebraic constraints between rigid bodies.
//!
//! Every constraint removes a fixed number of degrees of freedom and, given
//! the current poses and velocities, writes:
//! - `C`  – its residual (zero when the relation holds)
//! - `dC` – the residual's time derivative
//! - `J`  – ∂C/∂state for each participating body (a `dof × 6` block)
//! - `dJ` – the time derivative of those blocks
//!
//! Two families of rows are used by all six kinds:
//!
//! ```text
//! point rows      C = (x_a + R_a l_a) - (x_b + R_b l_b)      (or - pin)
//!                 J_a = [ I, -[r_a]x ]          J_b = [ -I, [r_b]x ]
//!                 dJ_a = [ 0, -[w_a x r_a]x ]   dJ_b = [ 0, [w_b x r_b]x ]
//!
//! alignment rows  C = p . s   p fixed in body a, s fixed in body b (or world)
//!                 J_a(ang) = (p x s)^T          J_b(ang) = -(p x s)^T
//!                 dJ uses d(p x s)/dt = (w_a x p) x s + p x (w_b x s)
//! ```
//!
//! Auxiliary data (anchors, axes, reference frames) is converted to body-local
//! coordinates once, at construction, from the bodies' initial poses.

use nalgebra::{DMatrix, DVector};

use super::jacobian::BlockJacobian;
use super::states::{skew, BodyState, NMat3, NVec3, ObjectHandle, Pose, BODY_DOF};

/// Baumgarte gains applied to every row of a constraint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub ks: f64, // position error gain
    pub kd: f64, // velocity error gain
}

impl Default for Gains {
    /// Critically damped for a 10 rad/s correction frequency
    fn default() -> Self {
        Self { ks: 100.0, kd: 20.0 }
    }
}

/// Axis pairs used to lock a relative orientation: X.Y', Y.Z', Z.X'
const WELD_PAIRS: [(usize, usize); 3] = [(0, 1), (1, 2), (2, 0)];

/// The six built-in constraint kinds with their body-local data
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintKind {
    /// Body point pinned to a world point
    FixedJoint { anchor: NVec3, pin: NVec3 },
    /// Point on body a coincides with point on body b
    Joint { anchor_a: NVec3, anchor_b: NVec3 },
    /// Fixed joint + body rotates only about a world axis
    FixedPivot {
        anchor: NVec3,
        pin: NVec3,
        tangents: [NVec3; 2], // body-local, perpendicular to the axis
        axis: NVec3,          // world
    },
    /// Joint + both bodies share a rotation axis
    Pivot {
        anchor_a: NVec3,
        anchor_b: NVec3,
        tangents: [NVec3; 2], // body a local
        axis: NVec3,          // body b local
    },
    /// Fixed joint + orientation frozen in world
    FixedWeld {
        anchor: NVec3,
        pin: NVec3,
        frame: [NVec3; 3], // world basis seen from the body at construction
    },
    /// Joint + relative orientation frozen
    Weld {
        anchor_a: NVec3,
        anchor_b: NVec3,
        frame_a: [NVec3; 3],
        frame_b: [NVec3; 3],
    },
}

impl ConstraintKind {
    pub fn dof(&self) -> usize {
        match self {
            Self::FixedJoint { .. } | Self::Joint { .. } => 3,
            Self::FixedPivot { .. } | Self::Pivot { .. } => 5,
            Self::FixedWeld { .. } | Self::Weld { .. } => 6,
        }
    }

    pub fn body_count(&self) -> usize {
        match self {
            Self::FixedJoint { .. } | Self::FixedPivot { .. } | Self::FixedWeld { .. } => 1,
            Self::Joint { .. } | Self::Pivot { .. } | Self::Weld { .. } => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FixedJoint { .. } => "fixed_joint",
            Self::Joint { .. } => "joint",
            Self::FixedPivot { .. } => "fixed_pivot",
            Self::Pivot { .. } => "pivot",
            Self::FixedWeld { .. } => "fixed_weld",
            Self::Weld { .. } => "weld",
        }
    }
}

/// Read-only view of the state a constraint is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct Kinematics<'a> {
    pub poses: &'a [Pose], // per body
    pub velocity: &'a DVector<f64>, // 6 per body: linear then angular
}

impl Kinematics<'_> {
    pub fn linear(&self, body: usize) -> NVec3 {
        self.velocity.fixed_rows::<3>(BODY_DOF * body).into_owned()
    }

    pub fn angular(&self, body: usize) -> NVec3 {
        self.velocity.fixed_rows::<3>(BODY_DOF * body + 3).into_owned()
    }
}

/// The global vectors/matrices constraints write into
#[derive(Debug, Clone)]
pub struct ConstraintBuffers {
    pub c: DVector<f64>,
    pub dc: DVector<f64>,
    pub j: BlockJacobian,
    pub dj: BlockJacobian,
}

impl ConstraintBuffers {
    pub fn new(layout: &[(usize, Vec<usize>)], body_count: usize) -> Self {
        let j = BlockJacobian::new(layout, body_count);
        let rows = j.nrows();
        Self {
            c: DVector::zeros(rows),
            dc: DVector::zeros(rows),
            dj: j.clone(),
            j,
        }
    }
}

/// A constraint over one or two bodies
#[derive(Debug, Clone)]
pub struct Constraint {
    kind: ConstraintKind,
    handles: Vec<ObjectHandle>, // participating scene objects
    indices: Vec<usize>, // resolved body indices, filled at initialize
    gains: Option<Gains>, // None = system default
}

impl Constraint {
    fn from_kind(kind: ConstraintKind, handles: Vec<ObjectHandle>) -> Self {
        Self {
            kind,
            handles,
            indices: Vec::new(),
            gains: None,
        }
    }

    /// Keep `pin` (world) attached to the point of `body` currently under it
    pub fn fixed_joint(body: &BodyState, pin: NVec3) -> Self {
        let kind = ConstraintKind::FixedJoint {
            anchor: body.pose().inverse_transform_point(&pin),
            pin,
        };
        Self::from_kind(kind, vec![body.handle()])
    }

    /// Keep the points of `a` and `b` currently at `pin` together
    pub fn joint(a: &BodyState, b: &BodyState, pin: NVec3) -> Self {
        let kind = ConstraintKind::Joint {
            anchor_a: a.pose().inverse_transform_point(&pin),
            anchor_b: b.pose().inverse_transform_point(&pin),
        };
        Self::from_kind(kind, vec![a.handle(), b.handle()])
    }

    /// Fixed joint that also only lets `body` spin about the world `axis`
    pub fn fixed_pivot(body: &BodyState, pin: NVec3, axis: NVec3) -> Self {
        let axis = axis / axis.norm();
        let inv = body.pose().orientation.inverse();
        let [t1, t2] = perpendiculars(&axis);
        let kind = ConstraintKind::FixedPivot {
            anchor: body.pose().inverse_transform_point(&pin),
            pin,
            tangents: [inv * t1, inv * t2],
            axis,
        };
        Self::from_kind(kind, vec![body.handle()])
    }

    /// Joint whose bodies may only rotate relative to each other about `axis`
    pub fn pivot(a: &BodyState, b: &BodyState, pin: NVec3, axis: NVec3) -> Self {
        let axis = axis / axis.norm();
        let inv_a = a.pose().orientation.inverse();
        let [t1, t2] = perpendiculars(&axis);
        let kind = ConstraintKind::Pivot {
            anchor_a: a.pose().inverse_transform_point(&pin),
            anchor_b: b.pose().inverse_transform_point(&pin),
            tangents: [inv_a * t1, inv_a * t2],
            axis: b.pose().orientation.inverse() * axis,
        };
        Self::from_kind(kind, vec![a.handle(), b.handle()])
    }

    /// Weld `body` to the world at `pin`
    pub fn fixed_weld(body: &BodyState, pin: NVec3) -> Self {
        let inv = body.pose().orientation.inverse();
        let kind = ConstraintKind::FixedWeld {
            anchor: body.pose().inverse_transform_point(&pin),
            pin,
            frame: world_basis().map(|e| inv * e),
        };
        Self::from_kind(kind, vec![body.handle()])
    }

    /// Weld `a` and `b` together at `pin`
    pub fn weld(a: &BodyState, b: &BodyState, pin: NVec3) -> Self {
        let inv_a = a.pose().orientation.inverse();
        let inv_b = b.pose().orientation.inverse();
        let kind = ConstraintKind::Weld {
            anchor_a: a.pose().inverse_transform_point(&pin),
            anchor_b: b.pose().inverse_transform_point(&pin),
            frame_a: world_basis().map(|e| inv_a * e),
            frame_b: world_basis().map(|e| inv_b * e),
        };
        Self::from_kind(kind, vec![a.handle(), b.handle()])
    }

    /// Override the Baumgarte gains
    pub fn with_gains(mut self, ks: f64, kd: f64) -> Self {
        self.gains = Some(Gains { ks, kd });
        self
    }

    pub fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    /// Degrees of freedom this constraint removes
    pub fn dof(&self) -> usize {
        self.kind.dof()
    }

    /// Own gains, if overridden
    pub fn gains(&self) -> Option<Gains> {
        self.gains
    }

    pub fn handles(&self) -> &[ObjectHandle] {
        &self.handles
    }

    /// Body indices, empty until the owning system is initialized
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub(crate) fn bind(&mut self, indices: Vec<usize>) {
        self.indices = indices;
    }

    /// Fill `C`, `dC` and this constraint's `J` / `dJ` blocks.
    ///
    /// `row` is the first global row owned by the constraint and `index` its
    /// position in the system (which selects its Jacobian blocks).
    pub fn evaluate(&self, kin: &Kinematics<'_>, row: usize, index: usize, out: &mut ConstraintBuffers) {
        let ConstraintBuffers { c, dc, j, dj } = out;
        let jb = j.blocks_mut(index);
        let djb = dj.blocks_mut(index);
        let mut residual = [0.0; BODY_DOF];

        let a = self.indices[0];
        let pose_a = &kin.poses[a];
        let w_a = kin.angular(a);

        match &self.kind {
            ConstraintKind::FixedJoint { anchor, pin }
            | ConstraintKind::FixedPivot { anchor, pin, .. }
            | ConstraintKind::FixedWeld { anchor, pin, .. } => {
                let r = pose_a.orientation * anchor;
                let err = pose_a.position + r - pin;
                residual[..3].copy_from_slice(err.as_slice());
                write_point_rows(&mut jb[0], &mut djb[0], &r, &w_a, 1.0);
            }
            ConstraintKind::Joint { anchor_a, anchor_b, .. }
            | ConstraintKind::Pivot { anchor_a, anchor_b, .. }
            | ConstraintKind::Weld { anchor_a, anchor_b, .. } => {
                let b = self.indices[1];
                let pose_b = &kin.poses[b];
                let r_a = pose_a.orientation * anchor_a;
                let r_b = pose_b.orientation * anchor_b;
                let err = (pose_a.position + r_a) - (pose_b.position + r_b);
                residual[..3].copy_from_slice(err.as_slice());
                write_point_rows(&mut jb[0], &mut djb[0], &r_a, &w_a, 1.0);
                write_point_rows(&mut jb[1], &mut djb[1], &r_b, &kin.angular(b), -1.0);
            }
        }

        // Alignment rows follow the three point rows
        let mut align = |k: usize, p: NVec3, s: NVec3, w_b: Option<NVec3>, jb: &mut [DMatrix<f64>], djb: &mut [DMatrix<f64>]| {
            residual[3 + k] = p.dot(&s);
            let n = p.cross(&s);
            let mut dn = w_a.cross(&p).cross(&s);
            if let Some(w_b) = w_b {
                dn += p.cross(&w_b.cross(&s));
            }
            write_alignment_row(&mut jb[0], &mut djb[0], 3 + k, &n, &dn, 1.0);
            if w_b.is_some() {
                write_alignment_row(&mut jb[1], &mut djb[1], 3 + k, &n, &dn, -1.0);
            }
        };

        match &self.kind {
            ConstraintKind::FixedJoint { .. } | ConstraintKind::Joint { .. } => {}
            ConstraintKind::FixedPivot { tangents, axis, .. } => {
                for (k, t) in tangents.iter().enumerate() {
                    align(k, pose_a.orientation * t, *axis, None, &mut *jb, &mut *djb);
                }
            }
            ConstraintKind::Pivot { tangents, axis, .. } => {
                let b = self.indices[1];
                let s = kin.poses[b].orientation * axis;
                for (k, t) in tangents.iter().enumerate() {
                    align(k, pose_a.orientation * t, s, Some(kin.angular(b)), &mut *jb, &mut *djb);
                }
            }
            ConstraintKind::FixedWeld { frame, .. } => {
                let world = world_basis();
                for (k, (i, jx)) in WELD_PAIRS.iter().enumerate() {
                    align(k, pose_a.orientation * frame[*i], world[*jx], None, &mut *jb, &mut *djb);
                }
            }
            ConstraintKind::Weld { frame_a, frame_b, .. } => {
                let b = self.indices[1];
                let rot_b = kin.poses[b].orientation;
                for (k, (i, jx)) in WELD_PAIRS.iter().enumerate() {
                    align(k, pose_a.orientation * frame_a[*i], rot_b * frame_b[*jx], Some(kin.angular(b)), &mut *jb, &mut *djb);
                }
            }
        }

        let dof = self.dof();
        c.rows_mut(row, dof).copy_from_slice(&residual[..dof]);

        // dC = J * dq over this constraint's blocks
        let mut rate = dc.rows_mut(row, dof);
        rate.fill(0.0);
        for (body, block) in self.indices.iter().zip(jb.iter()) {
            rate.gemv(1.0, block, &kin.velocity.rows(BODY_DOF * body, BODY_DOF), 1.0);
        }
    }
}

/// Point-coincidence rows 0..3 for one body, `sign` = +1 for body a, -1 for body b
fn write_point_rows(j: &mut DMatrix<f64>, dj: &mut DMatrix<f64>, r: &NVec3, w: &NVec3, sign: f64) {
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(NMat3::identity() * sign));
    j.fixed_view_mut::<3, 3>(0, 3).copy_from(&(skew(r) * -sign));
    dj.fixed_view_mut::<3, 3>(0, 0).fill(0.0);
    dj.fixed_view_mut::<3, 3>(0, 3).copy_from(&(skew(&w.cross(r)) * -sign));
}

/// One alignment row: angular part only
fn write_alignment_row(j: &mut DMatrix<f64>, dj: &mut DMatrix<f64>, row: usize, n: &NVec3, dn: &NVec3, sign: f64) {
    for col in 0..3 {
        j[(row, col)] = 0.0;
        dj[(row, col)] = 0.0;
        j[(row, 3 + col)] = sign * n[col];
        dj[(row, 3 + col)] = sign * dn[col];
    }
}

fn world_basis() -> [NVec3; 3] {
    [NVec3::x(), NVec3::y(), NVec3::z()]
}

/// Two unit vectors completing `axis` (unit) to an orthonormal basis
fn perpendiculars(axis: &NVec3) -> [NVec3; 2] {
    let helper = if axis.x.abs() < 0.9 { NVec3::x() } else { NVec3::y() };
    let t1 = axis.cross(&helper).normalize();
    let t2 = axis.cross(&t1);
    [t1, t2]
}
