//! Perspective camera with one frame of matrix history.

use glam::{Mat4, Vec3};

/// Keeps the previous frame's view-projection so reprojection can find where
/// a surface was last frame.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    previous_view_projection: Option<Mat4>,
    frame_index: u32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
            previous_view_projection: None,
            frame_index: 0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3, up: Vec3, fov: f32, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            up,
            fov,
            aspect,
            ..Self::default()
        }
    }

    /// Point the camera at `target` without moving it.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    /// Place the camera on a circle of `radius` around `target` at `height`,
    /// `angle` radians around the Y axis, looking at the target.
    pub fn orbit(&mut self, target: Vec3, radius: f32, height: f32, angle: f32) {
        self.position = target + Vec3::new(radius * angle.cos(), height, radius * angle.sin());
        self.look_at(target);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Last frame's view-projection, or the current one before the first
    /// [`Self::end_frame`].
    pub fn previous_view_projection_matrix(&self) -> Mat4 {
        self.previous_view_projection
            .unwrap_or_else(|| self.view_projection_matrix())
    }

    /// Frames finished so far.
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Remember this frame's matrices for the next one.
    pub fn end_frame(&mut self) {
        self.previous_view_projection = Some(self.view_projection_matrix());
        self.frame_index = self.frame_index.wrapping_add(1);
    }

    /// Drop the history, e.g. after a cut or resize.
    pub fn reset_history(&mut self) {
        self.previous_view_projection = None;
    }

    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::from(self)
    }
}

/// Per-frame camera block shared by the raster and ray tracing paths.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    pub previous_view_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
    /// `x` holds the frame index.
    pub frame: [u32; 4],
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        Self {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            inverse_view: view.inverse().to_cols_array_2d(),
            inverse_projection: projection.inverse().to_cols_array_2d(),
            previous_view_projection: camera
                .previous_view_projection_matrix()
                .to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
            frame: [camera.frame_index, 0, 0, 0],
        }
    }
}
