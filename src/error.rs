use std::io;

/// 核心错误类型
///
/// 前四种变体对应调用方需要区分处理的错误类别，其余均为底层错误的透明包装。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 非法的视口 / 图层标识、错误的向量维度等，不会执行任何实际工作
    #[error("配置错误: {0}")]
    Configuration(String),
    /// 源文件、金字塔或索引文件缺失
    #[error("未找到: {0}")]
    NotFound(String),
    /// 全零的嵌入矩阵、与元数据不符的栅格等
    #[error("数据完整性错误: {0}")]
    DataIntegrity(String),
    /// 搜索或重新标注过程中的失败
    #[error("计算错误: {0}")]
    Computation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),
    #[error(transparent)]
    ViewNpy(#[from] ndarray_npy::ViewNpyError),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    /// 是否为文件缺失类错误，包括底层的 `io::ErrorKind::NotFound`
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
